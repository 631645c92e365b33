//! Boot scripts and the El Torito CD boot path.
//!
//! A script image begins `#!ipxe`; executing it feeds each line through
//! the interpreter. Failed commands set `$?` and the script carries on
//! unless its own `&&` / `||` chains decide otherwise.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_kernel::error::{Error, Result};
use cinder_image::{register_image_type, BootPlan, Image, ImageType, Segment};
use cinder_san::SanDevice;

use crate::commands::execute_line;

const SCRIPT_SHEBANG: &[u8] = b"#!ipxe";

fn probe(image: &Image) -> Result<()> {
    image.with_data(|data| {
        if data.starts_with(SCRIPT_SHEBANG) {
            Ok(())
        } else {
            Err(Error::NoExec)
        }
    })
}

fn exec(image: &Image) -> Result<BootPlan> {
    let text = image.with_data(|data| String::from_utf8_lossy(data).into_owned());
    log::info!("running script {}", image.name());
    for line in text.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        execute_line(line);
    }
    // Scripts execute inline: the empty plan tells the caller there is
    // nothing left to jump to
    Ok(BootPlan::default())
}

static SCRIPT_TYPE: ImageType = ImageType {
    name: "script",
    probe,
    exec,
};

pub fn init() {
    register_image_type(&SCRIPT_TYPE);
}

// ============================================================================
// El Torito
// ============================================================================

const BOOT_RECORD_LBA: u64 = 17;
const EL_TORITO_ID: &[u8] = b"EL TORITO SPECIFICATION";

/// Read the El Torito boot catalog and build the plan for its initial
/// entry
pub fn el_torito_plan(device: &Arc<SanDevice>) -> Result<BootPlan> {
    let sector_size = device.capacity().block_size;

    // Boot record volume descriptor at sector 17
    let mut brvd = alloc::vec![0u8; sector_size];
    device.read(BOOT_RECORD_LBA, 1, &mut brvd)?;
    if brvd[0] != 0x00 || &brvd[1..6] != b"CD001" {
        return Err(Error::NoExec);
    }
    if !brvd[7..39].starts_with(EL_TORITO_ID) {
        return Err(Error::NoExec);
    }
    let catalog_lba = u64::from(u32::from_le_bytes([
        brvd[0x47], brvd[0x48], brvd[0x49], brvd[0x4a],
    ]));

    // Boot catalog: validation entry + initial/default entry
    let mut catalog = alloc::vec![0u8; sector_size];
    device.read(catalog_lba, 1, &mut catalog)?;
    if catalog[0] != 0x01 || catalog[30..32] != [0x55, 0xaa] {
        return Err(Error::NoExec);
    }
    let initial = &catalog[32..64];
    if initial[0] != 0x88 {
        // Not marked bootable
        return Err(Error::NoExec);
    }
    let load_segment = u16::from_le_bytes([initial[2], initial[3]]);
    let load_segment = if load_segment == 0 { 0x07c0 } else { load_segment };
    let sector_count = usize::from(u16::from_le_bytes([initial[6], initial[7]]));
    let image_lba = u64::from(u32::from_le_bytes([
        initial[8], initial[9], initial[10], initial[11],
    ]));

    // Sector count is in 512-byte virtual sectors
    let byte_len = sector_count.max(1) * 512;
    let cd_sectors = byte_len.div_ceil(sector_size);
    let mut boot_image = alloc::vec![0u8; cd_sectors * sector_size];
    device.read(image_lba, cd_sectors, &mut boot_image)?;
    boot_image.truncate(byte_len);

    let dest = u64::from(load_segment) << 4;
    log::info!(
        "El Torito boot image: {byte_len} bytes at {dest:#07x} from sector {image_lba}"
    );
    Ok(BootPlan {
        entry: dest,
        segments: alloc::vec![Segment {
            dest,
            memsz: boot_image.len() as u64,
            data: boot_image,
        }],
        register_a: None,
        info_addr: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::register_builtins;
    use cinder_kernel::console::{set_console, Console};
    use spin::Mutex;

    struct Capture(Mutex<String>);

    impl Console for Capture {
        fn put(&self, byte: u8) {
            self.0.lock().push(byte as char);
        }

        fn get(&self) -> Option<u8> {
            None
        }
    }

    #[test]
    fn script_probe_requires_shebang() {
        let script = Image::new("s", b"#!ipxe\necho hi\n".to_vec());
        assert!(probe(&script).is_ok());
        let not_script = Image::new("n", b"echo hi\n".to_vec());
        assert_eq!(probe(&not_script).err(), Some(Error::NoExec));
    }

    #[test]
    fn script_lines_execute_in_order() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let console = Arc::new(Capture(Mutex::new(String::new())));
        set_console(console.clone());

        let script = Image::new(
            "boot.ipxe",
            b"#!ipxe\necho one\n# a comment\n\necho two\n".to_vec(),
        );
        let plan = exec(&script).unwrap();
        assert_eq!(plan.segments.len(), 0);
        let output = console.0.lock().clone();
        assert_eq!(output, "one\ntwo\n");
    }

    #[test]
    fn failed_line_does_not_stop_script() {
        let _guard = crate::TEST_MUTEX.lock();
        register_builtins();
        let console = Arc::new(Capture(Mutex::new(String::new())));
        set_console(console.clone());

        let script = Image::new(
            "robust.ipxe",
            b"#!ipxe\nbogus-command\necho survived\n".to_vec(),
        );
        exec(&script).unwrap();
        assert!(console.0.lock().contains("survived\n"));
    }
}
