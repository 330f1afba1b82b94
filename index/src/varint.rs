//! 7-bit variable-length integer codec.
//!
//! Index files store all unsigned integers in a little-endian base-128
//! encoding: each byte carries 7 payload bits in its low bits, the high bit
//! is set on every byte except the last.  A `u64` therefore occupies 1 to 10
//! bytes.  Signed values are mapped onto unsigned ones with the zig-zag
//! transform before encoding.

/// Maximum number of bytes a single encoded `u64` can occupy.
pub const MAX_ENCODED_LEN: usize = 10;

/// Encodes `value` into `buf` and returns the number of bytes written.
///
/// `buf` must hold at least [`MAX_ENCODED_LEN`] bytes.
pub fn encode_uint(buf: &mut [u8], mut value: u64) -> usize {
    let mut len = 0;
    while value >= 0x80 {
        buf[len] = (value as u8 & 0x7f) | 0x80;
        value >>= 7;
        len += 1;
    }
    buf[len] = value as u8;
    len + 1
}

/// Appends the encoding of `value` to `out`.
pub fn encode_uint_into(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; MAX_ENCODED_LEN];
    let len = encode_uint(&mut buf, value);
    out.extend_from_slice(&buf[..len]);
}

/// Encodes a signed `value` via the zig-zag mapping.
pub fn encode_int(buf: &mut [u8], value: i64) -> usize {
    encode_uint(buf, zigzag(value))
}

/// Maps a signed value onto an unsigned one: `0, -1, 1, -2, …` become
/// `0, 1, 2, 3, …`.
pub fn zigzag(value: i64) -> u64 {
    if value < 0 {
        (-1 - 2i128 * value as i128) as u64
    } else {
        2 * value as u64
    }
}

/// Maps an unsigned value produced by [`zigzag`] back to the signed original.
pub fn decode_int(value: u64) -> i64 {
    if value % 2 == 1 {
        (-1i128 - (value / 2) as i128) as i64
    } else {
        (value / 2) as i64
    }
}

/// Decodes one unsigned integer from the start of `bytes`.
///
/// Returns the value and the number of bytes consumed, or `None` if `bytes`
/// ends inside the number or the encoding would exceed 64 bits of payload.
pub fn decode_uint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        if shift > 63 {
            return None;
        }
        if b < 0x80 {
            return Some((value.wrapping_add((b as u64) << shift), i + 1));
        }
        value = value.wrapping_add(((b & 0x7f) as u64) << shift);
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn roundtrip(value: u64) {
        let mut buf = [0u8; MAX_ENCODED_LEN];
        let len = encode_uint(&mut buf, value);
        let (decoded, consumed) = decode_uint(&buf[..len]).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, len);
    }

    #[test]
    fn uint_roundtrip() {
        for value in [0, 1, 0x7f, 0x80, 0x3fff, 0x4000, u64::MAX - 1, u64::MAX] {
            roundtrip(value);
        }
    }

    #[test]
    fn uint_roundtrip_random() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1d5);
        for _ in 0..10_000 {
            let bits = rng.gen_range(0..64);
            roundtrip(rng.gen::<u64>() >> bits);
        }
    }

    #[test]
    fn encoded_length() {
        // ceil(bits / 7) bytes, with a minimum of one byte for zero.
        let mut buf = [0u8; MAX_ENCODED_LEN];
        assert_eq!(encode_uint(&mut buf, 0), 1);
        for bits in 1..=64u32 {
            let value = 1u64 << (bits - 1);
            assert_eq!(encode_uint(&mut buf, value), bits.div_ceil(7) as usize);
        }
    }

    #[test]
    fn int_roundtrip() {
        for value in [0, -1, 1, -2, 2, i64::MIN, i64::MAX, -12345, 12345] {
            assert_eq!(decode_int(zigzag(value)), value);
        }
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(-2), 3);
    }

    #[test]
    fn truncated_input() {
        // A lone continuation byte is not a complete number.
        assert_eq!(decode_uint(&[0x80]), None);
        assert_eq!(decode_uint(&[]), None);
    }

    #[test]
    fn oversized_encoding_rejected() {
        // Eleven continuation bytes push the payload shift past 64 bits.
        let bytes = [0x80u8; 11];
        assert_eq!(decode_uint(&bytes), None);
        // Ten bytes with a terminated final byte are still legal (u64::MAX).
        let mut buf = [0u8; MAX_ENCODED_LEN];
        let len = encode_uint(&mut buf, u64::MAX);
        assert_eq!(len, 10);
        assert_eq!(decode_uint(&buf[..len]), Some((u64::MAX, 10)));
    }
}
