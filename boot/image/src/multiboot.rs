//! # Multiboot (0.6.96) Loader
//!
//! Scans the first 8 KiB (4-byte aligned) for the header magic, verifies
//! the checksum, and loads either through the embedded ELF headers
//! (preferred) or the raw address fields. The boot information structure
//! carries the memory map, the command line and every other registered
//! image as a page-aligned module; control transfers with 0x2BADB002 in
//! the accumulator.

use alloc::string::String;
use alloc::vec::Vec;

use spin::RwLock;

use cinder_kernel::error::{Error, Result};

use crate::elf;
use crate::image::{self, register_image_type, BootPlan, Image, ImageType, Segment};

/// Header magic an OS image carries
pub const MULTIBOOT_MAGIC: u32 = 0x1badb002;
/// Magic handed to the OS in register A
pub const MULTIBOOT_BOOT_MAGIC: u32 = 0x2badb002;

/// Header search window
const SEARCH_LIMIT: usize = 8192;

// Header flag bits
const FLAG_PGALIGN: u32 = 0x0000_0001;
const FLAG_MEMMAP: u32 = 0x0000_0002;
const FLAG_VIDMODE: u32 = 0x0000_0004;
const FLAG_RAW: u32 = 0x0001_0000;

/// Flags we can honour
const SUPPORTED_FLAGS: u32 = FLAG_PGALIGN | FLAG_MEMMAP | FLAG_RAW;
/// Flag bits an image may demand of us
const COMPULSORY_FLAGS: u32 = 0x0000_ffff;

/// Where the boot information structure is assembled
const MBINFO_ADDR: u64 = 0x9000;

/// A usable-memory region reported to the OS
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub start: u64,
    pub len: u64,
    /// Multiboot type 1 = usable RAM
    pub usable: bool,
}

static MEMORY_MAP: RwLock<Vec<MemRegion>> = RwLock::new(Vec::new());

/// Install the platform memory map reported through mbinfo
pub fn set_memory_map(regions: Vec<MemRegion>) {
    *MEMORY_MAP.write() = regions;
}

struct Header {
    offset: usize,
    flags: u32,
    header_addr: u32,
    load_addr: u32,
    load_end: u32,
    bss_end: u32,
    entry: u32,
}

/// Locate and validate the Multiboot header
fn find_header(data: &[u8]) -> Result<Header> {
    let limit = data.len().min(SEARCH_LIMIT);
    let mut offset = 0;
    while offset + 12 <= limit {
        let magic = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        if magic == MULTIBOOT_MAGIC {
            let flags = u32::from_le_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]);
            let checksum = u32::from_le_bytes([
                data[offset + 8],
                data[offset + 9],
                data[offset + 10],
                data[offset + 11],
            ]);
            if magic.wrapping_add(flags).wrapping_add(checksum) == 0 {
                let word = |index: usize| -> u32 {
                    let at = offset + 12 + index * 4;
                    if at + 4 <= data.len() {
                        u32::from_le_bytes([
                            data[at],
                            data[at + 1],
                            data[at + 2],
                            data[at + 3],
                        ])
                    } else {
                        0
                    }
                };
                return Ok(Header {
                    offset,
                    flags,
                    header_addr: word(0),
                    load_addr: word(1),
                    load_end: word(2),
                    bss_end: word(3),
                    entry: word(4),
                });
            }
        }
        offset += 4;
    }
    Err(Error::NoExec)
}

fn probe(image: &Image) -> Result<()> {
    image.with_data(|data| {
        let header = find_header(data)?;
        if header.flags & COMPULSORY_FLAGS & !SUPPORTED_FLAGS != 0 {
            log::warn!(
                "{} demands unsupported Multiboot flags {:#010x}",
                image.name(),
                header.flags
            );
            return Err(Error::NotSupported);
        }
        Ok(())
    })
}

/// Load via the raw address fields (no ELF header usable)
fn load_raw(data: &[u8], header: &Header) -> Result<(u64, Vec<Segment>)> {
    if header.load_addr > header.header_addr {
        return Err(Error::NoExec);
    }
    let file_offset = header.offset - (header.header_addr - header.load_addr) as usize;
    let file_end = if header.load_end != 0 {
        file_offset + (header.load_end - header.load_addr) as usize
    } else {
        data.len()
    };
    let bytes = data.get(file_offset..file_end).ok_or(Error::NoExec)?;
    let memsz = if header.bss_end != 0 {
        u64::from(header.bss_end) - u64::from(header.load_addr)
    } else {
        bytes.len() as u64
    };
    Ok((
        u64::from(header.entry),
        alloc::vec![Segment {
            dest: u64::from(header.load_addr),
            data: bytes.to_vec(),
            memsz,
        }],
    ))
}

/// Serialise the boot information structure plus module list
fn build_mbinfo(image: &Image, modules: &[(u64, u64, String)]) -> (Vec<u8>, u64) {
    let mut info = alloc::vec![0u8; 116];
    let mut flags: u32 = 0;

    let mut heap: Vec<u8> = Vec::new();
    let heap_base = MBINFO_ADDR + info.len() as u64;
    let mut alloc_str = |heap: &mut Vec<u8>, s: &str| -> u32 {
        let at = heap_base + heap.len() as u64;
        heap.extend_from_slice(s.as_bytes());
        heap.push(0);
        at as u32
    };

    // Memory map + mem_lower/mem_upper
    let regions = MEMORY_MAP.read().clone();
    if !regions.is_empty() {
        flags |= 0x0040 | 0x0001; // MMAP + MEM
        let mut mem_upper: u64 = 0;
        for region in &regions {
            if region.usable && region.start <= 0x10_0000 {
                let end = region.start + region.len;
                if end > 0x10_0000 {
                    mem_upper = (end - 0x10_0000) / 1024;
                }
            }
        }
        info[4..8].copy_from_slice(&640u32.to_le_bytes()); // mem_lower KiB
        info[8..12].copy_from_slice(&(mem_upper as u32).to_le_bytes());

        // mmap entries: size(4) base(8) len(8) type(4)
        while heap.len() % 4 != 0 {
            heap.push(0);
        }
        let mmap_addr = heap_base + heap.len() as u64;
        for region in &regions {
            heap.extend_from_slice(&20u32.to_le_bytes());
            heap.extend_from_slice(&region.start.to_le_bytes());
            heap.extend_from_slice(&region.len.to_le_bytes());
            heap.extend_from_slice(&if region.usable { 1u32 } else { 2u32 }.to_le_bytes());
        }
        let mmap_len = (regions.len() * 24) as u32;
        info[44..48].copy_from_slice(&mmap_len.to_le_bytes());
        info[48..52].copy_from_slice(&(mmap_addr as u32).to_le_bytes());
    }

    // Command line
    if let Some(cmdline) = image.cmdline.lock().clone() {
        flags |= 0x0004;
        let at = alloc_str(&mut heap, &alloc::format!("{} {}", image.name(), cmdline));
        info[16..20].copy_from_slice(&at.to_le_bytes());
    }

    // Boot loader name
    flags |= 0x0200;
    let loader = alloc_str(&mut heap, "cinder");
    info[64..68].copy_from_slice(&loader.to_le_bytes());

    // Modules
    if !modules.is_empty() {
        flags |= 0x0008;
        while heap.len() % 4 != 0 {
            heap.push(0);
        }
        // Module string table first
        let mut string_addrs = Vec::new();
        for (_, _, name) in modules {
            string_addrs.push(alloc_str(&mut heap, name));
        }
        while heap.len() % 4 != 0 {
            heap.push(0);
        }
        let mods_addr = heap_base + heap.len() as u64;
        for ((start, end, _), string_addr) in modules.iter().zip(string_addrs) {
            heap.extend_from_slice(&(*start as u32).to_le_bytes());
            heap.extend_from_slice(&(*end as u32).to_le_bytes());
            heap.extend_from_slice(&string_addr.to_le_bytes());
            heap.extend_from_slice(&0u32.to_le_bytes());
        }
        info[20..24].copy_from_slice(&(modules.len() as u32).to_le_bytes());
        info[24..28].copy_from_slice(&(mods_addr as u32).to_le_bytes());
    }

    info[0..4].copy_from_slice(&flags.to_le_bytes());
    info.extend_from_slice(&heap);
    (info, MBINFO_ADDR)
}

fn exec(image: &Image) -> Result<BootPlan> {
    let (entry, mut segments) = image.with_data(|data| {
        let header = find_header(data)?;
        // An embedded ELF header is authoritative when present
        match elf::parse(data) {
            Ok(info) => Ok((info.entry, info.segments)),
            Err(_) => load_raw(data, &header),
        }
    })?;

    // Every other registered image becomes a page-aligned module
    let mut next_free = segments
        .iter()
        .map(|s| s.dest + s.memsz)
        .max()
        .unwrap_or(0x10_0000);
    let mut modules: Vec<(u64, u64, String)> = Vec::new();
    for other in image::images() {
        if other.name() == image.name() {
            continue;
        }
        next_free = (next_free + 0xfff) & !0xfff;
        let data = other.data();
        let end = next_free + data.len() as u64;
        modules.push((next_free, end, String::from(other.name())));
        segments.push(Segment {
            dest: next_free,
            memsz: data.len() as u64,
            data,
        });
        next_free = end;
    }

    let (info, info_addr) = build_mbinfo(image, &modules);
    segments.push(Segment {
        dest: info_addr,
        memsz: info.len() as u64,
        data: info,
    });

    log::info!("multiboot entry {entry:#010x}");
    Ok(BootPlan {
        entry,
        segments,
        register_a: Some(MULTIBOOT_BOOT_MAGIC),
        info_addr: Some(info_addr),
    })
}

static MULTIBOOT_TYPE: ImageType = ImageType {
    name: "Multiboot",
    probe,
    exec,
};

pub fn init() {
    register_image_type(&MULTIBOOT_TYPE);
}
