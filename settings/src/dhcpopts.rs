//! # DHCP Option Block Codec
//!
//! TLV encoding: one tag byte, one length byte, value. Tags 0 (pad) and
//! 255 (end) are single bytes with no length. Encapsulated blocks recurse:
//! a single top-level tag whose value is itself a TLV stream terminated by
//! an end marker.
//!
//! The parser is paranoid: it never assumes the block is well formed, and
//! stops at any length that would run past the end of the data.

use alloc::vec::Vec;

use cinder_kernel::error::{Error, Result};

use crate::tag::{Tag, DHCP_END, DHCP_PAD};

const OPTION_HEADER_LEN: usize = 2;
const MAX_OPTION_LEN: usize = 255;

/// A mutable block of DHCP options
#[derive(Debug, Clone, Default)]
pub struct DhcpOptions {
    data: Vec<u8>,
    /// Used length (up to and including the last non-pad option)
    used: usize,
}

/// Length of the whole option starting at `data[offset]`, header included
fn option_len(data: &[u8], offset: usize) -> usize {
    match data.get(offset) {
        Some(&DHCP_PAD) | Some(&DHCP_END) | None => 1,
        Some(_) => data
            .get(offset + 1)
            .map(|&l| l as usize + OPTION_HEADER_LEN)
            .unwrap_or(1),
    }
}

impl DhcpOptions {
    /// Create an empty option block
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a prepopulated block of option data
    ///
    /// A zeroed block counts as valid (all padding).
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut options = Self {
            data: data.to_vec(),
            used: 0,
        };
        options.update_len();
        options
    }

    /// Raw option bytes, up to the used length
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Recalculate the used length by scanning for the last non-pad option
    fn update_len(&mut self) {
        let mut offset = 0;
        self.used = 0;
        while offset < self.data.len() {
            let len = option_len(&self.data, offset);
            if offset + len > self.data.len() {
                break;
            }
            offset += len;
            if self.data[offset - len] != DHCP_PAD {
                self.used = offset;
            }
        }
    }

    /// Find an option, recursing into its encapsulator if the tag asks for
    /// it
    ///
    /// Returns `(option_offset, encap_offset)`. The encapsulator offset is
    /// reported whenever the encapsulator was entered, even if the inner
    /// option itself is absent.
    fn find(&self, tag: Tag) -> (Option<usize>, Option<usize>) {
        if tag.encapsulated() == DHCP_PAD {
            return (None, None);
        }
        let mut wanted = if tag.is_encap() {
            tag.encapsulator()
        } else {
            tag.encapsulated()
        };
        let mut encap_offset = None;
        let mut offset = 0;
        let mut remaining = self.used;
        while remaining > 0 {
            let len = option_len(&self.data, offset);
            if len > remaining {
                break;
            }
            remaining -= len;
            let this_tag = self.data[offset];
            if this_tag == DHCP_END {
                if wanted == DHCP_END {
                    return (Some(offset), encap_offset);
                }
                break;
            }
            if this_tag == wanted {
                if tag.is_encap() && encap_offset.is_none() {
                    // Found the encapsulator: continue inside it
                    encap_offset = Some(offset);
                    wanted = tag.encapsulated();
                    remaining = len - OPTION_HEADER_LEN;
                    offset += OPTION_HEADER_LEN;
                    continue;
                }
                return (Some(offset), encap_offset);
            }
            offset += len;
        }
        (None, encap_offset)
    }

    /// Offset at which a new option would be created (the end marker, or
    /// the end of used data)
    fn creation_offset(&self) -> usize {
        self.find(Tag::new(DHCP_END)).0.unwrap_or(self.used)
    }

    /// Resize the option at `offset` from `old_len` to `new_len` total
    /// bytes, shifting the remainder of the block
    fn resize(&mut self, offset: usize, encap_offset: Option<usize>,
              old_len: usize, new_len: usize) -> Result<()> {
        if new_len > MAX_OPTION_LEN + OPTION_HEADER_LEN {
            return Err(Error::NoBufs);
        }
        if let Some(encap) = encap_offset {
            let encap_len = self.data[encap + 1] as usize + new_len - old_len;
            if encap_len > MAX_OPTION_LEN {
                return Err(Error::NoBufs);
            }
            self.data[encap + 1] = encap_len as u8;
        }
        let tail_start = offset + old_len;
        if new_len > old_len {
            let grow = new_len - old_len;
            self.data
                .splice(tail_start..tail_start, core::iter::repeat(0).take(grow));
        } else {
            self.data.drain(offset + new_len..tail_start);
        }
        self.used = (self.used + new_len) - old_len;
        Ok(())
    }

    /// Set, replace or delete (data `None`) an option
    ///
    /// Encapsulators are created and deleted as necessary.
    pub fn store(&mut self, tag: Tag, data: Option<&[u8]>) -> Result<()> {
        if tag.encapsulated() == DHCP_PAD {
            return Err(Error::InvalidArgument);
        }
        let new_len = data.map(|d| d.len() + OPTION_HEADER_LEN).unwrap_or(0);

        let mut creation = self.creation_offset();
        let (found, mut encap_offset) = self.find(tag);

        // Ensure the encapsulator exists before creating inside it
        if tag.is_encap() {
            if encap_offset.is_none() {
                if data.is_none() {
                    return Ok(());
                }
                let encap_tag = Tag::new(tag.encapsulator());
                self.store(encap_tag, Some(&[DHCP_END]))?;
                encap_offset = self.find(encap_tag).0;
            }
            let encap = encap_offset.ok_or(Error::NoBufs)?;
            creation = encap + OPTION_HEADER_LEN;
        }

        let (offset, old_len) = match found {
            Some(offset) => (offset, option_len(&self.data, offset)),
            None => (creation, 0),
        };

        self.resize(offset, encap_offset, old_len, new_len)?;

        if let Some(data) = data {
            self.data[offset] = tag.encapsulated();
            self.data[offset + 1] = data.len() as u8;
            self.data[offset + 2..offset + 2 + data.len()].copy_from_slice(data);
        }

        // Delete an encapsulator left holding only its end marker
        if let Some(encap) = encap_offset {
            if self.data[encap + 1] as usize <= 1 {
                self.store(Tag::new(tag.encapsulator()), None)?;
            }
        }
        Ok(())
    }

    /// Fetch an option's value
    ///
    /// Successive top-level options carrying the same tag concatenate
    /// (RFC 3396 long-option semantics).
    pub fn fetch(&self, tag: Tag) -> Option<Vec<u8>> {
        let offset = self.find(tag).0?;
        let len = self.data[offset + 1] as usize;
        let mut value = self.data[offset + 2..offset + 2 + len].to_vec();

        if !tag.is_encap() {
            // Concatenate any further instances of the same tag
            let mut next = offset + option_len(&self.data, offset);
            while next < self.used {
                let this_len = option_len(&self.data, next);
                if next + this_len > self.used {
                    break;
                }
                if self.data[next] == DHCP_END {
                    break;
                }
                if self.data[next] == tag.encapsulated() && this_len >= OPTION_HEADER_LEN {
                    let extra = self.data[next + 1] as usize;
                    value.extend_from_slice(&self.data[next + 2..next + 2 + extra]);
                }
                next += this_len;
            }
        }
        Some(value)
    }

    /// True if the block contains no options
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag;

    #[test]
    fn store_and_fetch() {
        let mut opts = DhcpOptions::new();
        opts.store(tag::ROUTERS, Some(&[10, 0, 2, 2])).unwrap();
        opts.store(tag::HOST_NAME, Some(b"pxe")).unwrap();
        assert_eq!(opts.fetch(tag::ROUTERS).unwrap(), [10, 0, 2, 2]);
        assert_eq!(opts.fetch(tag::HOST_NAME).unwrap(), b"pxe");
        assert_eq!(opts.fetch(tag::DNS_SERVERS), None);
    }

    #[test]
    fn replace_resizes_in_place() {
        let mut opts = DhcpOptions::new();
        opts.store(tag::HOST_NAME, Some(b"a")).unwrap();
        opts.store(tag::ROOT_PATH, Some(b"/boot")).unwrap();
        opts.store(tag::HOST_NAME, Some(b"longer-name")).unwrap();
        assert_eq!(opts.fetch(tag::HOST_NAME).unwrap(), b"longer-name");
        assert_eq!(opts.fetch(tag::ROOT_PATH).unwrap(), b"/boot");
        opts.store(tag::HOST_NAME, None).unwrap();
        assert_eq!(opts.fetch(tag::HOST_NAME), None);
        assert_eq!(opts.fetch(tag::ROOT_PATH).unwrap(), b"/boot");
    }

    #[test]
    fn encapsulated_options() {
        let mut opts = DhcpOptions::new();
        opts.store(tag::EB_USERNAME, Some(b"user")).unwrap();
        opts.store(tag::EB_PASSWORD, Some(b"pass")).unwrap();
        assert_eq!(opts.fetch(tag::EB_USERNAME).unwrap(), b"user");
        assert_eq!(opts.fetch(tag::EB_PASSWORD).unwrap(), b"pass");
        // The raw block has exactly one 175 encapsulator
        let count_175 = {
            let mut count = 0;
            let mut offset = 0;
            while offset < opts.as_bytes().len() {
                if opts.as_bytes()[offset] == 175 {
                    count += 1;
                }
                offset += option_len(opts.as_bytes(), offset);
            }
            count
        };
        assert_eq!(count_175, 1);

        // Deleting both encapsulated options removes the encapsulator
        opts.store(tag::EB_USERNAME, None).unwrap();
        opts.store(tag::EB_PASSWORD, None).unwrap();
        assert_eq!(opts.fetch(Tag::new(175)), None);
    }

    #[test]
    fn parse_wire_block() {
        // message-type=offer, routers, pad, end
        let wire = [53, 1, 2, 3, 4, 10, 0, 2, 2, 0, 255];
        let opts = DhcpOptions::from_bytes(&wire);
        assert_eq!(opts.fetch(tag::MESSAGE_TYPE).unwrap(), [2]);
        assert_eq!(opts.fetch(tag::ROUTERS).unwrap(), [10, 0, 2, 2]);
    }

    #[test]
    fn truncated_block_is_safe() {
        // Length byte claims more data than present
        let wire = [67, 200, b'x'];
        let opts = DhcpOptions::from_bytes(&wire);
        assert_eq!(opts.fetch(tag::BOOTFILE_NAME), None);
    }

    #[test]
    fn same_tag_concatenates() {
        // Two instances of option 67 split across TLVs
        let wire = [67, 3, b'a', b'b', b'c', 67, 2, b'd', b'e', 255];
        let opts = DhcpOptions::from_bytes(&wire);
        assert_eq!(opts.fetch(tag::BOOTFILE_NAME).unwrap(), b"abcde");
    }

    #[test]
    fn round_trip_encode_decode() {
        let mut opts = DhcpOptions::new();
        opts.store(tag::MESSAGE_TYPE, Some(&[1])).unwrap();
        opts.store(tag::SUBNET_MASK, Some(&[255, 255, 255, 0])).unwrap();
        opts.store(tag::EB_BIOS_DRIVE, Some(&[0x81])).unwrap();
        let decoded = DhcpOptions::from_bytes(opts.as_bytes());
        assert_eq!(decoded.fetch(tag::MESSAGE_TYPE).unwrap(), [1]);
        assert_eq!(decoded.fetch(tag::SUBNET_MASK).unwrap(), [255, 255, 255, 0]);
        assert_eq!(decoded.fetch(tag::EB_BIOS_DRIVE).unwrap(), [0x81]);
    }
}
