//! # ATA over Ethernet
//!
//! A layer-2 block transport: ATA commands ride raw Ethernet frames with
//! ethertype 0x88A2, addressed by shelf/slot. Discovery is a broadcast
//! config query; the first matching response pins the target's MAC.
//! Commands match responses by tag.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process;
use cinder_kernel::uri::Uri;
use cinder_net::ethernet::ETH_P_AOE;
use cinder_net::netdev::{self, MacAddr, NetDevice, NetProtocol};

use crate::block::{BlockDevice, Capacity};
use crate::device::{register_san_opener, SanOpener, SAN_COMMAND_TIMEOUT};

const AOE_VERSION: u8 = 0x10;
const CMD_ATA: u8 = 0;
const CMD_CONFIG: u8 = 1;

/// ATA sector size
const SECTOR: usize = 512;

/// Max sectors per AoE ATA command (fits a 1500-byte frame minus headers)
const MAX_SECTORS: usize = 2;

const ATA_READ_EXT: u8 = 0x24;
const ATA_WRITE_EXT: u8 = 0x34;
const ATA_IDENTIFY: u8 = 0xec;

struct AoeState {
    /// Resolved target MAC, once configured
    target: Option<MacAddr>,
    next_tag: u32,
    /// In-flight command: tag, response buffer, completion
    pending: Option<(u32, Vec<u8>, Option<Result<()>>)>,
}

/// An AoE target
pub struct AoeTarget {
    dev: Arc<NetDevice>,
    major: u16,
    minor: u8,
    state: Mutex<AoeState>,
}

static TARGETS: Mutex<Vec<Arc<AoeTarget>>> = Mutex::new(Vec::new());

impl AoeTarget {
    /// Parse an AoE URI: `aoe:e<major>.<minor>`
    pub fn parse(opaque: &str) -> Result<(u16, u8)> {
        let spec = opaque.strip_prefix('e').ok_or(Error::InvalidArgument)?;
        let (major, minor) = spec.split_once('.').ok_or(Error::InvalidArgument)?;
        Ok((
            major.parse().map_err(|_| Error::InvalidArgument)?,
            minor.parse().map_err(|_| Error::InvalidArgument)?,
        ))
    }

    /// Discover and attach a target on the first open device
    pub fn attach(major: u16, minor: u8) -> Result<Arc<AoeTarget>> {
        let dev = netdev::net_devices()
            .into_iter()
            .find(|d| d.is_open())
            .ok_or(Error::NetUnreachable)?;
        let target = Arc::new(AoeTarget {
            dev,
            major,
            minor,
            state: Mutex::new(AoeState {
                target: None,
                next_tag: 1,
                pending: None,
            }),
        });
        TARGETS.lock().push(target.clone());

        // Broadcast a config query and wait for the shelf to answer
        target.send_config_query()?;
        let done = process::wait_until(
            || target.state.lock().target.is_some(),
            Some(SAN_COMMAND_TIMEOUT),
        );
        if !done {
            TARGETS.lock().retain(|t| !Arc::ptr_eq(t, &target));
            return Err(Error::TimedOut);
        }
        Ok(target)
    }

    /// The 10-byte AoE common header (the Ethernet header is the link
    /// layer's business)
    fn header(&self, command: u8, tag: u32) -> [u8; 10] {
        let mut hdr = [0u8; 10];
        hdr[0] = AOE_VERSION; // version 1, no flags
        hdr[1] = 0; // error
        hdr[2..4].copy_from_slice(&self.major.to_be_bytes());
        hdr[4] = self.minor;
        hdr[5] = command;
        hdr[6..10].copy_from_slice(&tag.to_be_bytes());
        hdr
    }

    fn send_config_query(&self) -> Result<()> {
        let tag = {
            let mut state = self.state.lock();
            let tag = state.next_tag;
            state.next_tag += 1;
            tag
        };
        let mut iobuf = IoBuffer::alloc(32);
        let hdr = self.header(CMD_CONFIG, tag);
        iobuf.extend_from_slice(&hdr)?;
        // Buffer count / firmware / sector count / aoe version / ccmd /
        // config length: all zero for a query
        iobuf.extend_from_slice(&[0u8; 8])?;
        netdev::net_tx(iobuf, &self.dev, ETH_P_AOE, MacAddr::BROADCAST)
    }

    /// Issue one ATA command and block for its response
    fn ata_command(
        &self,
        ata_cmd: u8,
        lba: u64,
        sector_count: u8,
        write_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let (tag, dest) = {
            let mut state = self.state.lock();
            let dest = state.target.ok_or(Error::NetUnreachable)?;
            let tag = state.next_tag;
            state.next_tag += 1;
            state.pending = Some((tag, Vec::new(), None));
            (tag, dest)
        };

        let data_len = write_data.map(<[u8]>::len).unwrap_or(0);
        let mut iobuf = IoBuffer::alloc(24 + 12 + data_len);
        let hdr = self.header(CMD_ATA, tag);
        iobuf.extend_from_slice(&hdr)?;
        // ATA section: aflags, errfeat, sector count, cmd/status, lba[6],
        // reserved[2]
        let mut ata = [0u8; 12];
        ata[0] = if write_data.is_some() { 0x41 } else { 0x40 }; // extended LBA (+write)
        ata[2] = sector_count;
        ata[3] = ata_cmd;
        ata[4..10].copy_from_slice(&lba.to_be_bytes()[2..8]);
        // LBA is little-endian on the wire
        ata[4..10].reverse();
        iobuf.extend_from_slice(&ata)?;
        if let Some(data) = write_data {
            iobuf.ensure_tailroom(data.len());
            iobuf.extend_from_slice(data)?;
        }
        netdev::net_tx(iobuf, &self.dev, ETH_P_AOE, dest)?;

        let done = process::wait_until(
            || {
                self.state
                    .lock()
                    .pending
                    .as_ref()
                    .map(|(_, _, status)| status.is_some())
                    .unwrap_or(true)
            },
            Some(SAN_COMMAND_TIMEOUT),
        );
        let mut state = self.state.lock();
        let (ptag, data, status) = state.pending.take().ok_or(Error::ConnectionReset)?;
        if !done {
            return Err(Error::TimedOut);
        }
        if ptag != tag {
            return Err(Error::Protocol);
        }
        status.unwrap_or(Err(Error::TimedOut))?;
        Ok(data)
    }

    /// Process a response frame addressed to us
    fn rx_response(&self, payload: &[u8]) {
        if payload.len() < 10 || payload[0] & 0x08 == 0 {
            // Not a response
            return;
        }
        let major = u16::from_be_bytes([payload[2], payload[3]]);
        let minor = payload[4];
        if major != self.major || minor != self.minor {
            return;
        }
        let command = payload[5];
        let tag = u32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]]);
        let error = payload[1];

        match command {
            CMD_ATA => {
                let mut state = self.state.lock();
                if let Some((ptag, buf, status)) = state.pending.as_mut() {
                    if *ptag == tag && status.is_none() {
                        if error != 0 || payload.get(13).map(|s| s & 0x01 != 0).unwrap_or(true)
                        {
                            *status = Some(Err(Error::Platform(u32::from(error))));
                        } else {
                            buf.extend_from_slice(&payload[22..]);
                            *status = Some(Ok(()));
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

impl core::fmt::Debug for AoeTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "AoeTarget(e{}.{})", self.major, self.minor)
    }
}

/// Ethertype receive handler
fn rx(iobuf: IoBuffer, _dev: &Arc<NetDevice>, _ll_dest: MacAddr, ll_source: MacAddr) -> Result<()> {
    let payload = iobuf.as_ref();
    if payload.len() < 10 {
        return Err(Error::Protocol);
    }
    let major = u16::from_be_bytes([payload[2], payload[3]]);
    let minor = payload[4];
    let targets = TARGETS.lock().clone();
    for target in targets {
        if target.major == major && target.minor == minor {
            // A config response teaches us the target's MAC
            if payload[5] == CMD_CONFIG && payload[0] & 0x08 != 0 {
                let mut state = target.state.lock();
                if state.target.is_none() {
                    log::info!("aoe e{major}.{minor} at {ll_source}");
                    state.target = Some(ll_source);
                }
            }
            target.rx_response(payload);
        }
    }
    Ok(())
}

impl BlockDevice for AoeTarget {
    fn read(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        let mut lba = lba;
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(MAX_SECTORS);
            let data = self.ata_command(ATA_READ_EXT, lba, chunk as u8, None)?;
            let bytes = chunk * SECTOR;
            if data.len() < bytes {
                return Err(Error::Protocol);
            }
            buf[offset..offset + bytes].copy_from_slice(&data[..bytes]);
            offset += bytes;
            lba += chunk as u64;
            remaining -= chunk;
        }
        Ok(())
    }

    fn write(&self, lba: u64, count: usize, buf: &[u8]) -> Result<()> {
        let mut offset = 0;
        let mut lba = lba;
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(MAX_SECTORS);
            let bytes = chunk * SECTOR;
            self.ata_command(ATA_WRITE_EXT, lba, chunk as u8, Some(&buf[offset..offset + bytes]))?;
            offset += bytes;
            lba += chunk as u64;
            remaining -= chunk;
        }
        Ok(())
    }

    fn capacity(&self) -> Result<Capacity> {
        let identify = self.ata_command(ATA_IDENTIFY, 0, 1, None)?;
        if identify.len() < 512 {
            return Err(Error::Protocol);
        }
        // Words 100-103: 48-bit sector count (little-endian words)
        let mut sectors = 0u64;
        for word in (100..104).rev() {
            let lo = identify[word * 2];
            let hi = identify[word * 2 + 1];
            sectors = (sectors << 16) | u64::from(u16::from_le_bytes([lo, hi]));
        }
        if sectors == 0 {
            return Err(Error::Protocol);
        }
        Ok(Capacity {
            block_size: SECTOR,
            blocks: sectors,
            max_xfer: MAX_SECTORS,
        })
    }

    fn reset(&self) -> Result<()> {
        self.state.lock().target = None;
        self.send_config_query()?;
        let done = process::wait_until(
            || self.state.lock().target.is_some(),
            Some(SAN_COMMAND_TIMEOUT),
        );
        if done {
            Ok(())
        } else {
            Err(Error::TimedOut)
        }
    }
}

fn open_aoe(uri: &Uri) -> Result<Arc<dyn BlockDevice>> {
    let opaque = uri.opaque.as_deref().ok_or(Error::InvalidArgument)?;
    let (major, minor) = AoeTarget::parse(opaque)?;
    Ok(AoeTarget::attach(major, minor)?)
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        netdev::register_net_protocol(NetProtocol {
            name: "AoE",
            net_proto: ETH_P_AOE,
            rx,
        });
        register_san_opener(SanOpener {
            scheme: "aoe",
            open: open_aoe,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        assert_eq!(AoeTarget::parse("e7.0").unwrap(), (7, 0));
        assert_eq!(AoeTarget::parse("e100.3").unwrap(), (100, 3));
        assert!(AoeTarget::parse("7.0").is_err());
        assert!(AoeTarget::parse("e7").is_err());
    }
}
