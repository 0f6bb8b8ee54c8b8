//! Per-page out-of-band metadata.
//!
//! Every programmed page carries one of two views in its spare area, chosen
//! by the kind byte at offset 0:
//!
//! ```text
//!  0      1        5        7      8          9
//! +------+--------+--------+------+----------+------ ... 0xFF
//! | 0x40 | lpn    | usn             |                   user data
//! +------+--------+--------+------+----------+
//! | 0x8x | usn_dec| idx    | flags|                     VFL/FTL control
//! +------+--------+--------+------+
//! ```
//!
//! Multi-byte fields are little-endian. The remainder of the spare is left
//! at the erased pattern.

use thiserror::Error;

use crate::config::{Lpn, Usn};

pub const SPARE_LEN: usize = 12;

const KIND_USER: u8 = 0x40;
const KIND_VFL_CTX: u8 = 0x80;
const KIND_FTL_CKPT: u8 = 0x81;
const KIND_ERASED: u8 = 0xFF;

/// Set on the final page of a multi-page control group.
pub const META_F_LAST: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    VflContext,
    FtlCheckpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpareData {
    User {
        lpn: Lpn,
        usn: Usn,
    },
    Meta {
        kind: MetaKind,
        usn_dec: u32,
        idx: u16,
        flags: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpareError {
    #[error("spare area too small: {0} bytes")]
    Truncated(usize),
    #[error("spare is erased")]
    Erased,
    #[error("unknown spare kind 0x{0:02x}")]
    UnknownKind(u8),
}

impl SpareData {
    pub fn user(lpn: Lpn, usn: Usn) -> Self {
        SpareData::User { lpn, usn }
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<(), SpareError> {
        if out.len() < SPARE_LEN {
            return Err(SpareError::Truncated(out.len()));
        }
        out.fill(KIND_ERASED);
        match *self {
            SpareData::User { lpn, usn } => {
                out[0] = KIND_USER;
                out[1..5].copy_from_slice(&lpn.to_le_bytes());
                out[5..9].copy_from_slice(&usn.to_le_bytes());
            }
            SpareData::Meta {
                kind,
                usn_dec,
                idx,
                flags,
            } => {
                out[0] = match kind {
                    MetaKind::VflContext => KIND_VFL_CTX,
                    MetaKind::FtlCheckpoint => KIND_FTL_CKPT,
                };
                out[1..5].copy_from_slice(&usn_dec.to_le_bytes());
                out[5..7].copy_from_slice(&idx.to_le_bytes());
                out[7] = flags;
            }
        }
        Ok(())
    }

    pub fn decode(raw: &[u8]) -> Result<Self, SpareError> {
        if raw.len() < SPARE_LEN {
            return Err(SpareError::Truncated(raw.len()));
        }
        let r32 = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        match raw[0] {
            KIND_USER => Ok(SpareData::User {
                lpn: r32(1),
                usn: r32(5),
            }),
            kind @ (KIND_VFL_CTX | KIND_FTL_CKPT) => Ok(SpareData::Meta {
                kind: if kind == KIND_VFL_CTX {
                    MetaKind::VflContext
                } else {
                    MetaKind::FtlCheckpoint
                },
                usn_dec: r32(1),
                idx: u16::from_le_bytes([raw[5], raw[6]]),
                flags: raw[7],
            }),
            KIND_ERASED => Err(SpareError::Erased),
            other => Err(SpareError::UnknownKind(other)),
        }
    }

    /// Returns the user view, refusing control pages.
    pub fn as_user(&self) -> Option<(Lpn, Usn)> {
        match *self {
            SpareData::User { lpn, usn } => Some((lpn, usn)),
            SpareData::Meta { .. } => None,
        }
    }

    /// Returns the meta view if it is of the requested kind.
    pub fn as_meta(&self, want: MetaKind) -> Option<(u32, u16, u8)> {
        match *self {
            SpareData::Meta {
                kind,
                usn_dec,
                idx,
                flags,
            } if kind == want => Some((usn_dec, idx, flags)),
            _ => None,
        }
    }
}

/// Serial-number comparison: true if `a` was issued after `b`, even across
/// the `u32` wrap.
pub fn usn_is_newer(a: Usn, b: Usn) -> bool {
    a != b && a.wrapping_sub(b) < (1 << 31)
}
