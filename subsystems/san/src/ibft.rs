//! # iSCSI Boot Firmware Table
//!
//! Serialises the ACPI-adjacent iBFT so a booted OS can rediscover the
//! SAN it came from: a standard ACPI header, a control block pointing at
//! initiator / NIC / target blocks, with all pointers expressed as
//! offsets relative to the table base. The table must land in
//! 16-bit-addressable memory; building it into a plain byte vector leaves
//! placement to the platform layer.

use alloc::string::String;
use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use cinder_net::netdev::MacAddr;

const IBFT_SIGNATURE: &[u8; 4] = b"iBFT";
const IBFT_REVISION: u8 = 1;

// Structure IDs
const ID_CONTROL: u8 = 1;
const ID_INITIATOR: u8 = 2;
const ID_NIC: u8 = 3;
const ID_TARGET: u8 = 4;

// Block flags
const FLAG_BLOCK_VALID: u8 = 0x01;
const FLAG_FIRMWARE_BOOT: u8 = 0x02;

/// Everything the table describes
#[derive(Debug, Clone)]
pub struct IbftParameters {
    pub initiator_name: String,
    pub nic_ip: IpAddr,
    pub nic_prefix_len: u8,
    pub nic_gateway: Option<IpAddr>,
    pub nic_mac: MacAddr,
    pub nic_pci_location: u16,
    pub target_ip: IpAddr,
    pub target_port: u16,
    pub target_lun: u64,
    pub target_name: String,
}

/// IPs in the iBFT are always 16-byte fields (v4-mapped when IPv4)
fn ip_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

struct Builder {
    table: Vec<u8>,
    /// (offset-of-pointer-field, target-offset) fixups
    heap_strings: Vec<(usize, Vec<u8>)>,
}

impl Builder {
    fn new() -> Self {
        Self {
            table: Vec::new(),
            heap_strings: Vec::new(),
        }
    }

    fn pad_to(&mut self, align: usize) {
        while self.table.len() % align != 0 {
            self.table.push(0);
        }
    }

    /// Reserve a (length, offset) string pointer pair; the string itself
    /// lands in the heap after all blocks
    fn string_field(&mut self, value: &str) {
        let field_offset = self.table.len();
        self.table.extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.table.extend_from_slice(&0u16.to_le_bytes());
        self.heap_strings
            .push((field_offset + 2, value.as_bytes().to_vec()));
    }

    /// Standard structure header: id, version, length, index, flags
    fn block_header(&mut self, id: u8, length: u16, flags: u8) -> usize {
        let offset = self.table.len();
        self.table.push(id);
        self.table.push(1);
        self.table.extend_from_slice(&length.to_le_bytes());
        self.table.push(0); // index
        self.table.push(flags);
        offset
    }
}

/// Build the iBFT for one NIC/target pair
pub fn build_ibft(params: &IbftParameters) -> Vec<u8> {
    let mut b = Builder::new();

    // ACPI header (36 bytes for a rev-1 table); length and checksum are
    // patched at the end
    b.table.extend_from_slice(IBFT_SIGNATURE);
    b.table.extend_from_slice(&0u32.to_le_bytes()); // length
    b.table.push(IBFT_REVISION);
    b.table.push(0); // checksum
    b.table.extend_from_slice(b"CINDER"); // OEM ID
    b.table.extend_from_slice(b"NETBOOT "); // OEM table ID
    b.table.extend_from_slice(&1u32.to_le_bytes()); // OEM revision
    b.table.extend_from_slice(b"CNDR"); // creator
    b.table.extend_from_slice(&1u32.to_le_bytes()); // creator revision

    // Control block: structure header + extensions word + four pointer
    // slots (initiator, nic0, target0, nic1/target1 unused)
    b.pad_to(8);
    let control = b.block_header(ID_CONTROL, 18, FLAG_BLOCK_VALID);
    b.table.extend_from_slice(&0u16.to_le_bytes()); // extensions
    let pointer_slots = b.table.len();
    for _ in 0..5 {
        b.table.extend_from_slice(&0u16.to_le_bytes());
    }
    let _ = control;

    // Initiator block
    b.pad_to(8);
    let initiator = b.block_header(ID_INITIATOR, 74, FLAG_BLOCK_VALID | FLAG_FIRMWARE_BOOT);
    // SNS / SLP / radius servers: unspecified
    for _ in 0..4 {
        b.table.extend_from_slice(&[0u8; 16]);
    }
    b.string_field(&params.initiator_name);

    // NIC block
    b.pad_to(8);
    let nic = b.block_header(ID_NIC, 102, FLAG_BLOCK_VALID | FLAG_FIRMWARE_BOOT);
    b.table.extend_from_slice(&ip_bytes(params.nic_ip));
    b.table.push(params.nic_prefix_len);
    b.table.push(0); // origin
    let gateway = params
        .nic_gateway
        .map(ip_bytes)
        .unwrap_or_else(|| ip_bytes(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
    b.table.extend_from_slice(&gateway);
    // Primary/secondary DNS + DHCP server: unspecified
    for _ in 0..3 {
        b.table.extend_from_slice(&[0u8; 16]);
    }
    b.table.extend_from_slice(&0u16.to_le_bytes()); // VLAN
    b.table.extend_from_slice(&params.nic_mac.0);
    b.table
        .extend_from_slice(&params.nic_pci_location.to_le_bytes());
    b.string_field(""); // hostname

    // Target block
    b.pad_to(8);
    let target = b.block_header(ID_TARGET, 54, FLAG_BLOCK_VALID | FLAG_FIRMWARE_BOOT);
    b.table.extend_from_slice(&ip_bytes(params.target_ip));
    b.table.extend_from_slice(&params.target_port.to_le_bytes());
    b.table.extend_from_slice(&params.target_lun.to_le_bytes());
    b.table.push(0); // CHAP type: none in-table
    b.table.push(0); // NIC association index
    b.string_field(&params.target_name);
    // CHAP name/secret + reverse pair: absent
    for _ in 0..4 {
        b.table.extend_from_slice(&0u32.to_le_bytes());
    }

    // Patch the control block's pointer slots
    let fixup = |table: &mut Vec<u8>, slot: usize, offset: usize| {
        let bytes = (offset as u16).to_le_bytes();
        table[slot..slot + 2].copy_from_slice(&bytes);
    };
    fixup(&mut b.table, pointer_slots, initiator);
    fixup(&mut b.table, pointer_slots + 2, nic);
    fixup(&mut b.table, pointer_slots + 4, target);

    // String heap, then string pointer fixups (offsets from table base)
    for (field, value) in core::mem::take(&mut b.heap_strings) {
        b.pad_to(2);
        let offset = b.table.len();
        b.table.extend_from_slice(&value);
        b.table.push(0);
        let bytes = (offset as u16).to_le_bytes();
        b.table[field..field + 2].copy_from_slice(&bytes);
    }

    // Patch length and ACPI checksum
    let length = b.table.len() as u32;
    b.table[4..8].copy_from_slice(&length.to_le_bytes());
    let sum: u8 = b.table.iter().fold(0u8, |acc, &x| acc.wrapping_add(x));
    b.table[9] = 0u8.wrapping_sub(sum);

    b.table
}

/// Convenience: parameters from a hooked iSCSI device's live state
pub fn ibft_for(
    initiator_name: &str,
    nic_ip: Ipv4Addr,
    nic_prefix_len: u8,
    nic_gateway: Option<Ipv4Addr>,
    nic_mac: MacAddr,
    target_ip: IpAddr,
    target_port: u16,
    target_lun: u64,
    target_name: &str,
) -> Vec<u8> {
    build_ibft(&IbftParameters {
        initiator_name: initiator_name.into(),
        nic_ip: IpAddr::V4(nic_ip),
        nic_prefix_len,
        nic_gateway: nic_gateway.map(IpAddr::V4),
        nic_mac,
        nic_pci_location: 0,
        target_ip,
        target_port,
        target_lun,
        target_name: target_name.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        ibft_for(
            "iqn.2010-04.org.cinder:test",
            Ipv4Addr::new(10, 0, 2, 15),
            24,
            Some(Ipv4Addr::new(10, 0, 2, 2)),
            MacAddr([0x52, 0x54, 0, 1, 2, 3]),
            IpAddr::V4(Ipv4Addr::new(10, 0, 2, 20)),
            3260,
            0,
            "iqn.2020-01.example:target",
        )
    }

    #[test]
    fn header_and_checksum() {
        let table = sample();
        assert_eq!(&table[0..4], IBFT_SIGNATURE);
        let length = u32::from_le_bytes([table[4], table[5], table[6], table[7]]) as usize;
        assert_eq!(length, table.len());
        // ACPI checksum: all bytes sum to zero
        let sum: u8 = table.iter().fold(0u8, |acc, &x| acc.wrapping_add(x));
        assert_eq!(sum, 0);
    }

    #[test]
    fn control_pointers_resolve_to_blocks() {
        let table = sample();
        // Control block follows the 36-byte header at the next 8-byte
        // boundary; its pointer slots start after header(6) + ext(2)
        let control = 40;
        assert_eq!(table[control], ID_CONTROL);
        let slots = control + 8;
        let initiator = u16::from_le_bytes([table[slots], table[slots + 1]]) as usize;
        let nic = u16::from_le_bytes([table[slots + 2], table[slots + 3]]) as usize;
        let target = u16::from_le_bytes([table[slots + 4], table[slots + 5]]) as usize;
        assert_eq!(table[initiator], ID_INITIATOR);
        assert_eq!(table[nic], ID_NIC);
        assert_eq!(table[target], ID_TARGET);
    }

    #[test]
    fn strings_are_reachable_through_offsets() {
        let table = sample();
        // Find the initiator block and follow its name pointer
        let control = 40;
        let slots = control + 8;
        let initiator = u16::from_le_bytes([table[slots], table[slots + 1]]) as usize;
        let name_field = initiator + 6 + 64;
        let len = u16::from_le_bytes([table[name_field], table[name_field + 1]]) as usize;
        let offset =
            u16::from_le_bytes([table[name_field + 2], table[name_field + 3]]) as usize;
        let name = &table[offset..offset + len];
        assert_eq!(name, b"iqn.2010-04.org.cinder:test");
    }

    #[test]
    fn ipv4_addresses_are_v6_mapped() {
        let mapped = ip_bytes(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)));
        assert_eq!(&mapped[10..12], &[0xff, 0xff]);
        assert_eq!(&mapped[12..16], &[10, 0, 2, 15]);
    }
}
