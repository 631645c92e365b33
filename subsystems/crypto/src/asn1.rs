//! Allocation-free ASN.1 DER cursors.
//!
//! Public-key operations walk DER structures (RSA keys, X.509
//! SubjectPublicKeyInfo, DigestInfo) in place; a cursor narrows over the
//! underlying byte slice without copying.

use cinder_kernel::error::{Error, Result};

/// Universal class tags
pub const ASN1_INTEGER: u8 = 0x02;
pub const ASN1_BIT_STRING: u8 = 0x03;
pub const ASN1_OCTET_STRING: u8 = 0x04;
pub const ASN1_NULL: u8 = 0x05;
pub const ASN1_OID: u8 = 0x06;
pub const ASN1_SEQUENCE: u8 = 0x30;
pub const ASN1_SET: u8 = 0x31;
/// Context-specific constructed tag `[n]`
pub const fn asn1_explicit(n: u8) -> u8 {
    0xa0 | n
}

/// A cursor over DER-encoded data
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.data
    }

    /// Peek the tag of the next element
    pub fn peek_tag(&self) -> Result<u8> {
        self.data.first().copied().ok_or(Error::Protocol)
    }

    /// Read the header of the next element, returning `(tag, contents,
    /// rest)` without consuming the cursor
    fn split_next(&self) -> Result<(u8, &'a [u8], &'a [u8])> {
        let tag = *self.data.first().ok_or(Error::Protocol)?;
        let &len_byte = self.data.get(1).ok_or(Error::Protocol)?;
        let (len, header) = if len_byte & 0x80 == 0 {
            (len_byte as usize, 2)
        } else {
            let len_len = (len_byte & 0x7f) as usize;
            if len_len == 0 || len_len > 4 {
                return Err(Error::Protocol);
            }
            let mut len = 0usize;
            for i in 0..len_len {
                len = (len << 8) | *self.data.get(2 + i).ok_or(Error::Protocol)? as usize;
            }
            (len, 2 + len_len)
        };
        let contents = self
            .data
            .get(header..header + len)
            .ok_or(Error::Protocol)?;
        let rest = &self.data[header + len..];
        Ok((tag, contents, rest))
    }

    /// Enter the next element, checking its tag; the cursor advances past
    /// it and the returned cursor covers its contents
    pub fn enter(&mut self, expected_tag: u8) -> Result<Cursor<'a>> {
        let (tag, contents, rest) = self.split_next()?;
        if tag != expected_tag {
            return Err(Error::Protocol);
        }
        self.data = rest;
        Ok(Cursor::new(contents))
    }

    /// Skip the next element regardless of tag
    pub fn skip(&mut self) -> Result<()> {
        let (_, _, rest) = self.split_next()?;
        self.data = rest;
        Ok(())
    }

    /// Consume the next element and return its complete encoding
    /// (header included)
    pub fn raw_next(&mut self) -> Result<&'a [u8]> {
        let (_, _, rest) = self.split_next()?;
        let taken = self.data.len() - rest.len();
        let raw = &self.data[..taken];
        self.data = rest;
        Ok(raw)
    }

    /// Skip the next element if it carries the given tag
    pub fn skip_if(&mut self, tag: u8) -> Result<bool> {
        if self.peek_tag().ok() == Some(tag) {
            self.skip()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Read an INTEGER's magnitude bytes (leading sign zero stripped)
    pub fn integer_bytes(&mut self) -> Result<&'a [u8]> {
        let contents = self.enter(ASN1_INTEGER)?;
        let bytes = contents.remaining();
        Ok(if bytes.first() == Some(&0) && bytes.len() > 1 {
            &bytes[1..]
        } else {
            bytes
        })
    }

    /// Read a small non-negative INTEGER
    pub fn integer_u32(&mut self) -> Result<u32> {
        let bytes = self.integer_bytes()?;
        if bytes.len() > 4 {
            return Err(Error::Protocol);
        }
        let mut value = 0u32;
        for &b in bytes {
            value = (value << 8) | u32::from(b);
        }
        Ok(value)
    }

    /// Read a BIT STRING, requiring zero unused bits
    pub fn bit_string(&mut self) -> Result<&'a [u8]> {
        let contents = self.enter(ASN1_BIT_STRING)?;
        let bytes = contents.remaining();
        match bytes.split_first() {
            Some((0, rest)) => Ok(rest),
            _ => Err(Error::Protocol),
        }
    }

    /// Read an OID's raw contents
    pub fn oid(&mut self) -> Result<&'a [u8]> {
        Ok(self.enter(ASN1_OID)?.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_a_sequence_of_integers() {
        // SEQUENCE { INTEGER 5, INTEGER 0x0201 }
        let der = [0x30, 0x07, 0x02, 0x01, 0x05, 0x02, 0x02, 0x02, 0x01];
        let mut outer = Cursor::new(&der);
        let mut seq = outer.enter(ASN1_SEQUENCE).unwrap();
        assert_eq!(seq.integer_u32().unwrap(), 5);
        assert_eq!(seq.integer_u32().unwrap(), 0x0201);
        assert!(seq.is_empty());
        assert!(outer.is_empty());
    }

    #[test]
    fn long_form_length() {
        let mut der = alloc::vec![0x30, 0x82, 0x01, 0x00];
        der.extend(core::iter::repeat(0u8).take(256));
        let mut outer = Cursor::new(&der);
        let seq = outer.enter(ASN1_SEQUENCE).unwrap();
        assert_eq!(seq.remaining().len(), 256);
    }

    #[test]
    fn integer_sign_byte_stripped() {
        // INTEGER 0x00FF (positive, needs sign byte in DER)
        let der = [0x02, 0x02, 0x00, 0xff];
        let mut cursor = Cursor::new(&der);
        assert_eq!(cursor.integer_bytes().unwrap(), &[0xff]);
    }

    #[test]
    fn truncated_input_is_protocol_error() {
        let der = [0x30, 0x05, 0x02];
        let mut cursor = Cursor::new(&der);
        assert_eq!(cursor.enter(ASN1_SEQUENCE).err(), Some(Error::Protocol));
    }
}
