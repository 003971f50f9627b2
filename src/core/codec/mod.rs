//! Data codec for converting between bytes and display text
//!
//! Two display modes:
//! - Text (UTF-8, lossy on decode)
//! - Hexadecimal (upper-case, space separated)

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// How bytes are shown to and typed by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplayMode {
    /// Plain text (UTF-8)
    #[default]
    Text,
    /// Hexadecimal pairs
    Hex,
}

impl std::str::FromStr for DisplayMode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "ascii" | "utf8" => Ok(Self::Text),
            "hex" => Ok(Self::Hex),
            other => Err(CodecError::InvalidFormat(format!("unknown display mode '{other}'"))),
        }
    }
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Invalid input format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Invalid character
    #[error("Invalid character at position {0}: {1}")]
    InvalidCharacter(usize, char),
}

/// Render bytes as display text
///
/// Hex output is `"48 65 6C "`: every byte is followed by one space.
pub fn encode(data: &[u8], mode: DisplayMode) -> String {
    match mode {
        DisplayMode::Text => String::from_utf8_lossy(data).into_owned(),
        DisplayMode::Hex => {
            let mut out = String::with_capacity(data.len() * 3);
            for byte in data {
                let _ = write!(out, "{byte:02X} ");
            }
            out
        }
    }
}

/// Parse user input into bytes
///
/// Hex input ignores whitespace; it must contain an even number of hex digits.
pub fn decode(input: &str, mode: DisplayMode) -> Result<Vec<u8>, CodecError> {
    match mode {
        DisplayMode::Text => Ok(input.as_bytes().to_vec()),
        DisplayMode::Hex => {
            let mut digits = String::with_capacity(input.len());
            for (pos, c) in input.chars().enumerate() {
                if c.is_whitespace() {
                    continue;
                }
                if !c.is_ascii_hexdigit() {
                    return Err(CodecError::InvalidCharacter(pos, c));
                }
                digits.push(c);
            }
            if digits.len() % 2 != 0 {
                return Err(CodecError::InvalidFormat(
                    "hex input needs an even number of digits".into(),
                ));
            }
            hex::decode(&digits).map_err(|e| CodecError::InvalidFormat(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_hex() {
        assert_eq!(encode(&[0x01, 0xAB, 0xff], DisplayMode::Hex), "01 AB FF ");
        assert_eq!(encode(b"", DisplayMode::Hex), "");
    }

    #[test]
    fn test_encode_text_is_lossy() {
        assert_eq!(encode(b"OK\r\n", DisplayMode::Text), "OK\r\n");
        assert_eq!(encode(&[0x41, 0xFF], DisplayMode::Text), "A\u{FFFD}");
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode("01 ab\tFF", DisplayMode::Hex).unwrap(), vec![0x01, 0xAB, 0xFF]);
        assert_eq!(
            decode("0", DisplayMode::Hex),
            Err(CodecError::InvalidFormat("hex input needs an even number of digits".into()))
        );
        assert_eq!(decode("0x", DisplayMode::Hex), Err(CodecError::InvalidCharacter(1, 'x')));
    }
}
