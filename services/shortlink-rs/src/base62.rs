//! Base62 codec for short codes.
//!
//! Alphabet is `0-9 a-z A-Z` in that exact order (the `base62` crate's
//! "alternative" alphabet), so `0 → "0"`, `61 → "Z"`, `62 → "10"`.

use thiserror::Error;

/// The 62-character alphabet, index == digit value.
pub const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Base62Error {
    #[error("empty string")]
    EmptyString,
    #[error("invalid character {ch:?} at position {pos}")]
    InvalidCharacter { ch: char, pos: usize },
    #[error("value does not fit in 64 bits")]
    ValueTooLarge,
}

/// Encode an unsigned 64-bit integer.
pub fn encode(n: u64) -> String {
    base62::encode_alternative(n)
}

/// Encode, left-padding with `'0'` until the result is at least `min_len`
/// characters. Leading zeros are value-preserving, so `decode` round-trips.
pub fn encode_padded(n: u64, min_len: usize) -> String {
    format!("{:0>width$}", encode(n), width = min_len)
}

/// Decode a Base62 string back to the integer it encodes.
pub fn decode(s: &str) -> Result<u64, Base62Error> {
    match base62::decode_alternative(s) {
        Ok(v) => u64::try_from(v).map_err(|_| Base62Error::ValueTooLarge),
        Err(base62::DecodeError::EmptyInput) => Err(Base62Error::EmptyString),
        Err(base62::DecodeError::InvalidBase62Byte(b, pos)) => Err(Base62Error::InvalidCharacter {
            ch: b as char,
            pos,
        }),
        Err(base62::DecodeError::ArithmeticOverflow) => Err(Base62Error::ValueTooLarge),
    }
}

/// True when `s` is nonempty and every byte is in the alphabet.
pub fn is_valid(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_boundary_values() {
        assert_eq!(encode(0), "0");
        assert_eq!(encode(61), "Z");
        assert_eq!(encode(62), "10");
    }

    #[test]
    fn round_trips() {
        for n in [0u64, 1, 9, 10, 61, 62, 3843, 3844, 1_000_000, u64::MAX] {
            assert_eq!(decode(&encode(n)).unwrap(), n, "n = {n}");
        }
    }

    #[test]
    fn round_trips_with_padding() {
        for n in [0u64, 61, 62, 123_456_789] {
            let padded = encode_padded(n, 7);
            assert!(padded.len() >= 7);
            assert_eq!(decode(&padded).unwrap(), n, "n = {n}");
        }
    }

    #[test]
    fn padding_never_truncates() {
        let long = encode_padded(u64::MAX, 3);
        assert_eq!(long, encode(u64::MAX));
        assert!(long.len() > 3);
    }

    #[test]
    fn pads_with_zero() {
        assert_eq!(encode_padded(61, 4), "000Z");
        assert_eq!(encode_padded(0, 7), "0000000");
    }

    #[test]
    fn decode_rejects_empty() {
        assert_eq!(decode(""), Err(Base62Error::EmptyString));
    }

    #[test]
    fn decode_rejects_invalid_characters() {
        assert!(matches!(
            decode("abc!"),
            Err(Base62Error::InvalidCharacter { ch: '!', pos: 3 })
        ));
        assert!(matches!(
            decode("a/b"),
            Err(Base62Error::InvalidCharacter { ch: '/', pos: 1 })
        ));
    }

    #[test]
    fn validates_character_set() {
        assert!(is_valid("0aZ9"));
        assert!(!is_valid(""));
        assert!(!is_valid("abc-def"));
        assert!(!is_valid("with space"));
    }

    #[test]
    fn alphabet_is_positional() {
        for (i, &b) in ALPHABET.iter().enumerate() {
            let s = (b as char).to_string();
            assert_eq!(decode(&s).unwrap(), i as u64);
        }
    }
}
