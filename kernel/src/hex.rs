//! Hex codec with optional separators, used by the hex setting type and
//! MAC address formatting.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};

/// Encode bytes as lowercase hex, joining pairs with `sep` (pass `""` for
/// packed output)
pub fn encode(data: &[u8], sep: &str) -> String {
    let mut out = String::with_capacity(data.len() * (2 + sep.len()));
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        let hi = byte >> 4;
        let lo = byte & 0x0f;
        out.push(char::from_digit(hi.into(), 16).unwrap_or('0'));
        out.push(char::from_digit(lo.into(), 16).unwrap_or('0'));
    }
    out
}

/// Decode hex, accepting `:` or `-` separators between byte pairs
pub fn decode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut nibble: Option<u8> = None;
    for c in text.chars() {
        if c == ':' || c == '-' {
            if nibble.is_some() {
                return Err(Error::InvalidArgument);
            }
            continue;
        }
        let v = c.to_digit(16).ok_or(Error::InvalidArgument)? as u8;
        nibble = match nibble {
            None => Some(v),
            Some(hi) => {
                out.push((hi << 4) | v);
                None
            }
        };
    }
    if nibble.is_some() {
        return Err(Error::InvalidArgument);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_with_separator() {
        assert_eq!(encode(&[0xde, 0xad, 0x01], ":"), "de:ad:01");
        assert_eq!(encode(&[0xde, 0xad], ""), "dead");
    }

    #[test]
    fn decode_accepts_separators() {
        assert_eq!(decode("de:ad-01").unwrap(), [0xde, 0xad, 0x01]);
        assert_eq!(decode("DEAD").unwrap(), [0xde, 0xad]);
    }

    #[test]
    fn rejects_odd_and_garbage() {
        assert!(decode("abc").is_err());
        assert!(decode("a:bc").is_err());
        assert!(decode("zz").is_err());
    }
}
