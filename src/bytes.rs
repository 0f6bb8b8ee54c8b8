// Little-endian encoding helpers for the on-media control structures,
// independent of processor endianness.

/// Appends fields to a growing buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Pads to a word boundary and appends the checksum pair.
    pub fn seal(mut self) -> Vec<u8> {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        let (sum, xor) = checksum(&self.buf);
        self.u32(sum);
        self.u32(xor);
        self.buf
    }
}

/// Reads fields back; every getter returns `None` past the end.
pub struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, at: 0 }
    }

    /// Bytes consumed so far, rounded up to the word boundary `seal` pads to.
    pub fn sealed_body_len(&self) -> usize {
        (self.at + 3) & !3
    }

    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.at..self.at.checked_add(n)?)?;
        self.at += n;
        Some(out)
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Wrapping sum and xor of the buffer taken as little-endian words.
pub fn checksum(data: &[u8]) -> (u32, u32) {
    data.chunks(4).fold((0u32, 0u32), |(sum, xor), chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let v = u32::from_le_bytes(word);
        (sum.wrapping_add(v), xor ^ v)
    })
}

/// Checks the trailer written by [`Writer::seal`] on the first `len` bytes.
pub fn verify_sealed(data: &[u8], len: usize) -> bool {
    if len < 8 || len > data.len() || len % 4 != 0 {
        return false;
    }
    let body = &data[..len - 8];
    let mut trailer = Reader::new(&data[len - 8..len]);
    match (trailer.u32(), trailer.u32()) {
        (Some(sum), Some(xor)) => checksum(body) == (sum, xor),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_little_endian() {
        let mut w = Writer::new();
        w.u16(0xAA55);
        w.u32(0x0317_0605);
        let sealed = w.seal();
        assert_eq!(sealed[..6], [0x55, 0xAA, 0x05, 0x06, 0x17, 0x03]);

        let mut r = Reader::new(&sealed);
        assert_eq!(r.u16(), Some(0xAA55));
        assert_eq!(r.u32(), Some(0x0317_0605));
    }

    #[test]
    fn reader_stops_at_end() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.u16(), Some(0x0201));
        assert_eq!(r.u16(), None);
        assert_eq!(r.bytes(1), Some(&[3u8][..]));
    }

    #[test]
    fn seal_detects_single_bit_damage() {
        let mut w = Writer::new();
        w.bytes(b"VFLC");
        w.u32(42);
        w.u16(7);
        let mut sealed = w.seal();
        let len = sealed.len();
        assert_eq!(len % 4, 0);
        assert!(verify_sealed(&sealed, len));

        sealed[5] ^= 0x10;
        assert!(!verify_sealed(&sealed, len));
        assert!(!verify_sealed(&sealed, 4));
    }
}
