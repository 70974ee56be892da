//! Fixed two-digit lowercase hex, the only payload encoding on the wire.

use core::fmt;

const DIGITS: &[u8; 16] = b"0123456789abcdef";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HexError {
    /// Input has an odd number of digits
    OddLength,
    /// Character outside `[0-9a-f]`
    InvalidDigit(u8),
    /// Output buffer cannot hold the result
    BufferTooSmall,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::OddLength => write!(f, "odd number of hex digits"),
            HexError::InvalidDigit(c) => write!(f, "invalid hex digit 0x{:02x}", c),
            HexError::BufferTooSmall => write!(f, "output buffer too small"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HexError {}

fn nibble(c: u8) -> Result<u8, HexError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(HexError::InvalidDigit(c)),
    }
}

/// Encode `data` into `out`, returning the number of characters written.
pub fn encode(data: &[u8], out: &mut [u8]) -> Result<usize, HexError> {
    let len = data.len() * 2;
    if out.len() < len {
        return Err(HexError::BufferTooSmall);
    }

    for (byte, pair) in data.iter().zip(out.chunks_exact_mut(2)) {
        pair[0] = DIGITS[(byte >> 4) as usize];
        pair[1] = DIGITS[(byte & 0x0f) as usize];
    }

    Ok(len)
}

/// Decode lowercase hex into `out`, returning the number of bytes written.
///
/// Uppercase digits are rejected: the protocol is case-sensitive.
pub fn decode(text: &[u8], out: &mut [u8]) -> Result<usize, HexError> {
    if text.len() % 2 != 0 {
        return Err(HexError::OddLength);
    }

    let len = text.len() / 2;
    if out.len() < len {
        return Err(HexError::BufferTooSmall);
    }

    for (pair, byte) in text.chunks_exact(2).zip(out.iter_mut()) {
        *byte = (nibble(pair[0])? << 4) | nibble(pair[1])?;
    }

    Ok(len)
}

/// Decode exactly one byte from two lowercase hex digits.
pub fn decode_byte(text: &[u8]) -> Result<u8, HexError> {
    let mut byte = [0u8; 1];
    match text.len() {
        2 => decode(text, &mut byte).map(|_| byte[0]),
        1 => Err(HexError::OddLength),
        _ => Err(HexError::BufferTooSmall),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_lowercase() {
        let mut out = [0u8; 8];
        let n = encode(&[0xDE, 0xAD, 0xBE, 0xEF], &mut out).unwrap();
        assert_eq!(&out[..n], b"deadbeef");
    }

    #[test]
    fn test_round_trip_all_lengths() {
        let source: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37) ^ 0x5a).collect();
        let mut text = [0u8; 128];
        let mut back = [0u8; 64];

        for len in 0..=64 {
            let n = encode(&source[..len], &mut text).unwrap();
            assert_eq!(n, len * 2);
            let m = decode(&text[..n], &mut back).unwrap();
            assert_eq!(&back[..m], &source[..len]);
        }
    }

    #[test]
    fn test_decode_rejects_uppercase_and_junk() {
        let mut out = [0u8; 4];
        assert_eq!(decode(b"AABB", &mut out), Err(HexError::InvalidDigit(b'A')));
        assert_eq!(decode(b"0g", &mut out), Err(HexError::InvalidDigit(b'g')));
        assert_eq!(decode(b"a ", &mut out), Err(HexError::InvalidDigit(b' ')));
        assert_eq!(decode(b"abc", &mut out), Err(HexError::OddLength));
    }

    #[test]
    fn test_buffer_limits() {
        let mut small = [0u8; 1];
        assert_eq!(decode(b"0102", &mut small), Err(HexError::BufferTooSmall));
        assert_eq!(encode(&[1], &mut small), Err(HexError::BufferTooSmall));
    }

    #[test]
    fn test_decode_byte() {
        assert_eq!(decode_byte(b"50"), Ok(0x50));
        assert_eq!(decode_byte(b"5"), Err(HexError::OddLength));
        assert_eq!(decode_byte(b"500"), Err(HexError::BufferTooSmall));
    }
}
