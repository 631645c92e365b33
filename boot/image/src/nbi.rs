//! # NBI (Net Boot Image) Loader
//!
//! The legacy netboot format: a 512-byte header block with nibble-coded
//! structure lengths, followed by the segments described by a chain of
//! segment headers inside that block. Loading is two-pass - all segment
//! placements are resolved before any data is copied, so overlapping
//! segment tails cannot corrupt later headers. A segment header with a
//! zero length is rejected outright.

use alloc::vec::Vec;

use cinder_kernel::error::{Error, Result};

use crate::image::{register_image_type, BootPlan, Image, ImageType, Segment};

/// NBI magic number
pub const NBI_MAGIC: u32 = 0x1b03_1336;

const NBI_HEADER_LENGTH: usize = 512;

// Segment load-address semantics (flags low two bits)
const LOADADDR_ABS: u32 = 0x00;
const LOADADDR_AFTER: u32 = 0x01;
const LOADADDR_END: u32 = 0x02;
const LOADADDR_BEFORE: u32 = 0x03;

const FLAG_LAST_SEGHEADER: u32 = 1 << 2;

/// Nibble-coded structure length: low nibble counts dwords, high nibble
/// counts vendor dwords
fn nibble_len(byte: u8) -> usize {
    (usize::from(byte & 0x0f) << 2) + (usize::from(byte & 0xf0) >> 2)
}

fn u32le(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes([
        *data.get(offset)?,
        *data.get(offset + 1)?,
        *data.get(offset + 2)?,
        *data.get(offset + 3)?,
    ]))
}

struct SegDescriptor {
    dest: u64,
    file_offset: usize,
    imglength: usize,
    memlength: u64,
}

struct Parsed {
    entry: u64,
    segments: Vec<SegDescriptor>,
}

/// Walk the segment header chain, resolving placements (pass one)
fn parse(data: &[u8]) -> Result<Parsed> {
    if data.len() < NBI_HEADER_LENGTH {
        return Err(Error::NoExec);
    }
    if u32le(data, 0) != Some(NBI_MAGIC) {
        return Err(Error::NoExec);
    }
    let header_len = nibble_len(data[4]);
    if header_len == 0 {
        return Err(Error::NoExec);
    }
    let flags = u32le(data, 4).ok_or(Error::NoExec)?;
    // Execution address: seg:off pair or linear
    let entry = if flags & (1 << 31) != 0 {
        u64::from(u32le(data, 12).ok_or(Error::NoExec)?)
    } else {
        let offset = u16::from_le_bytes([data[12], data[13]]);
        let segment = u16::from_le_bytes([data[14], data[15]]);
        (u64::from(segment) << 4) + u64::from(offset)
    };

    let mut segments = Vec::new();
    let mut header_offset = header_len;
    let mut file_offset = NBI_HEADER_LENGTH;
    let mut last_end: u64 = 0;

    loop {
        if header_offset + 16 > NBI_HEADER_LENGTH {
            return Err(Error::NoExec);
        }
        let sh = &data[header_offset..header_offset + 16];
        let sh_len = nibble_len(sh[0]);
        if sh_len == 0 {
            // Ambiguous in the wild; deterministically not executable
            return Err(Error::NoExec);
        }
        let flags_word = u32::from(sh[3]);
        let loadaddr = u64::from(u32le(sh, 4).ok_or(Error::NoExec)?);
        let imglength = u32le(sh, 8).ok_or(Error::NoExec)? as usize;
        let memlength = u64::from(u32le(sh, 12).ok_or(Error::NoExec)?);

        let dest = match flags_word & 0x03 {
            LOADADDR_ABS => loadaddr,
            LOADADDR_AFTER => last_end + loadaddr,
            LOADADDR_BEFORE | LOADADDR_END => {
                // Placement relative to the end of memory needs the
                // platform memory map; nothing bootable uses it
                return Err(Error::NotSupported);
            }
            _ => unreachable!(),
        };

        if data.len() < file_offset + imglength {
            return Err(Error::NoExec);
        }
        segments.push(SegDescriptor {
            dest,
            file_offset,
            imglength,
            memlength: memlength.max(imglength as u64),
        });
        last_end = dest + memlength.max(imglength as u64);
        file_offset += imglength;

        if flags_word & FLAG_LAST_SEGHEADER != 0 {
            break;
        }
        header_offset += sh_len;
    }

    Ok(Parsed { entry, segments })
}

fn probe(image: &Image) -> Result<()> {
    image.with_data(|data| {
        if data.len() >= NBI_HEADER_LENGTH && u32le(data, 0) == Some(NBI_MAGIC) {
            Ok(())
        } else {
            Err(Error::NoExec)
        }
    })
}

fn exec(image: &Image) -> Result<BootPlan> {
    image.with_data(|data| {
        let parsed = parse(data)?;
        // Pass two: copy out the segment data
        let segments = parsed
            .segments
            .iter()
            .map(|seg| Segment {
                dest: seg.dest,
                data: data[seg.file_offset..seg.file_offset + seg.imglength].to_vec(),
                memsz: seg.memlength,
            })
            .collect();
        log::info!("NBI entry {:#010x}", parsed.entry);
        Ok(BootPlan {
            entry: parsed.entry,
            segments,
            register_a: None,
            info_addr: None,
        })
    })
}

static NBI_TYPE: ImageType = ImageType {
    name: "NBI",
    probe,
    exec,
};

pub fn init() {
    register_image_type(&NBI_TYPE);
}
