//! ELF loader: PT_LOAD segments with their filesz/memsz semantics.

use cinder_kernel::error::{Error, Result};

use crate::image::{register_image_type, BootPlan, Image, ImageType, Segment};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const PT_LOAD: u32 = 1;

/// Parsed view of the fields the loader needs
pub struct ElfInfo {
    pub entry: u64,
    pub segments: alloc::vec::Vec<Segment>,
}

fn u16le(d: &[u8], o: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*d.get(o)?, *d.get(o + 1)?]))
}

fn u32le(d: &[u8], o: usize) -> Option<u32> {
    Some(u32::from_le_bytes([
        *d.get(o)?,
        *d.get(o + 1)?,
        *d.get(o + 2)?,
        *d.get(o + 3)?,
    ]))
}

fn u64le(d: &[u8], o: usize) -> Option<u64> {
    Some(u64::from_le_bytes([
        *d.get(o)?,
        *d.get(o + 1)?,
        *d.get(o + 2)?,
        *d.get(o + 3)?,
        *d.get(o + 4)?,
        *d.get(o + 5)?,
        *d.get(o + 6)?,
        *d.get(o + 7)?,
    ]))
}

/// Parse an ELF32 or ELF64 little-endian executable
pub fn parse(data: &[u8]) -> Result<ElfInfo> {
    if data.len() < 52 || &data[..4] != ELF_MAGIC {
        return Err(Error::NoExec);
    }
    let class64 = match data[4] {
        1 => false,
        2 => true,
        _ => return Err(Error::NoExec),
    };
    if data[5] != 1 {
        // Big-endian images are nobody's boot kernel here
        return Err(Error::NoExec);
    }

    let (entry, phoff, phentsize, phnum) = if class64 {
        (
            u64le(data, 24).ok_or(Error::NoExec)?,
            u64le(data, 32).ok_or(Error::NoExec)? as usize,
            u16le(data, 54).ok_or(Error::NoExec)? as usize,
            u16le(data, 56).ok_or(Error::NoExec)? as usize,
        )
    } else {
        (
            u64::from(u32le(data, 24).ok_or(Error::NoExec)?),
            u32le(data, 28).ok_or(Error::NoExec)? as usize,
            u16le(data, 42).ok_or(Error::NoExec)? as usize,
            u16le(data, 44).ok_or(Error::NoExec)? as usize,
        )
    };

    let mut segments = alloc::vec::Vec::new();
    for index in 0..phnum {
        let ph = phoff + index * phentsize;
        let p_type = u32le(data, ph).ok_or(Error::NoExec)?;
        if p_type != PT_LOAD {
            continue;
        }
        let (offset, paddr, filesz, memsz) = if class64 {
            (
                u64le(data, ph + 8).ok_or(Error::NoExec)? as usize,
                u64le(data, ph + 24).ok_or(Error::NoExec)?,
                u64le(data, ph + 32).ok_or(Error::NoExec)? as usize,
                u64le(data, ph + 40).ok_or(Error::NoExec)?,
            )
        } else {
            (
                u32le(data, ph + 4).ok_or(Error::NoExec)? as usize,
                u32le(data, ph + 12).ok_or(Error::NoExec)?.into(),
                u32le(data, ph + 16).ok_or(Error::NoExec)? as usize,
                u32le(data, ph + 20).ok_or(Error::NoExec)?.into(),
            )
        };
        if memsz == 0 {
            continue;
        }
        let bytes = data.get(offset..offset + filesz).ok_or(Error::NoExec)?;
        segments.push(Segment {
            dest: paddr,
            data: bytes.to_vec(),
            memsz,
        });
    }
    if segments.is_empty() {
        return Err(Error::NoExec);
    }
    Ok(ElfInfo { entry, segments })
}

fn probe(image: &Image) -> Result<()> {
    image.with_data(|data| {
        if data.len() >= 4 && &data[..4] == ELF_MAGIC {
            Ok(())
        } else {
            Err(Error::NoExec)
        }
    })
}

fn exec(image: &Image) -> Result<BootPlan> {
    let info = image.with_data(parse)?;
    Ok(BootPlan {
        entry: info.entry,
        segments: info.segments,
        register_a: None,
        info_addr: None,
    })
}

static ELF_TYPE: ImageType = ImageType {
    name: "ELF",
    probe,
    exec,
};

pub fn init() {
    register_image_type(&ELF_TYPE);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Build a minimal ELF32 with one PT_LOAD segment
    pub(crate) fn tiny_elf32(entry: u32, paddr: u32, payload: &[u8], memsz: u32) -> Vec<u8> {
        let mut elf = alloc::vec![0u8; 52 + 32];
        elf[..4].copy_from_slice(ELF_MAGIC);
        elf[4] = 1; // 32-bit
        elf[5] = 1; // little-endian
        elf[6] = 1; // version
        elf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        elf[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        elf[24..28].copy_from_slice(&entry.to_le_bytes());
        elf[28..32].copy_from_slice(&52u32.to_le_bytes()); // phoff
        elf[42..44].copy_from_slice(&32u16.to_le_bytes()); // phentsize
        elf[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let data_offset = elf.len() as u32;
        let ph = 52;
        elf[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        elf[ph + 4..ph + 8].copy_from_slice(&data_offset.to_le_bytes());
        elf[ph + 12..ph + 16].copy_from_slice(&paddr.to_le_bytes());
        elf[ph + 16..ph + 20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        elf[ph + 20..ph + 24].copy_from_slice(&memsz.to_le_bytes());
        elf.extend_from_slice(payload);
        elf
    }

    #[test]
    fn parses_pt_load() {
        let elf = tiny_elf32(0x100000, 0x200000, b"kernelcode", 0x2000);
        let info = parse(&elf).unwrap();
        assert_eq!(info.entry, 0x100000);
        assert_eq!(info.segments.len(), 1);
        assert_eq!(info.segments[0].dest, 0x200000);
        assert_eq!(info.segments[0].data, b"kernelcode");
        assert_eq!(info.segments[0].memsz, 0x2000);
    }

    #[test]
    fn rejects_non_elf() {
        assert_eq!(parse(b"MZ not an elf").err(), Some(Error::NoExec));
    }

    #[test]
    fn truncated_segment_rejected() {
        let mut elf = tiny_elf32(0x1000, 0x1000, b"payload", 0x100);
        elf.truncate(elf.len() - 3);
        assert_eq!(parse(&elf).err(), Some(Error::NoExec));
    }
}
