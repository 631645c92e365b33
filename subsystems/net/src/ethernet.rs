//! Ethernet II link protocol.

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;

use crate::netdev::MacAddr;

/// Ethernet header length
pub const ETH_HLEN: usize = 14;

// Ethertypes
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_VLAN: u16 = 0x8100;
pub const ETH_P_IPV6: u16 = 0x86dd;
pub const ETH_P_AOE: u16 = 0x88a2;

/// A stripped link-layer header
#[derive(Debug, Clone, Copy)]
pub struct LinkHeader {
    pub dest: MacAddr,
    pub source: MacAddr,
    /// Ethertype in host order
    pub net_proto: u16,
}

/// A link-layer protocol
pub trait LinkProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// ARP hardware type
    fn ll_proto(&self) -> u16;

    fn ll_addr_len(&self) -> usize;

    /// Prepend a link header for transmission
    fn push(
        &self,
        iobuf: &mut IoBuffer,
        ll_dest: MacAddr,
        ll_source: MacAddr,
        net_proto: u16,
    ) -> Result<()>;

    /// Strip and parse the link header of a received frame
    fn pull(&self, iobuf: &mut IoBuffer) -> Result<LinkHeader>;

    /// Map a multicast network address onto a link address
    fn mc_hash(&self, net_proto: u16, net_addr: &[u8]) -> MacAddr;

    /// The broadcast link address
    fn broadcast(&self) -> MacAddr;
}

struct Ethernet;

impl LinkProtocol for Ethernet {
    fn name(&self) -> &'static str {
        "ethernet"
    }

    fn ll_proto(&self) -> u16 {
        // ARPHRD_ETHER
        1
    }

    fn ll_addr_len(&self) -> usize {
        6
    }

    fn push(
        &self,
        iobuf: &mut IoBuffer,
        ll_dest: MacAddr,
        ll_source: MacAddr,
        net_proto: u16,
    ) -> Result<()> {
        let header = iobuf.push(ETH_HLEN)?;
        header[0..6].copy_from_slice(&ll_dest.0);
        header[6..12].copy_from_slice(&ll_source.0);
        header[12..14].copy_from_slice(&net_proto.to_be_bytes());
        Ok(())
    }

    fn pull(&self, iobuf: &mut IoBuffer) -> Result<LinkHeader> {
        let header = iobuf.pull(ETH_HLEN).map_err(|_| Error::Protocol)?;
        let mut dest = MacAddr::default();
        let mut source = MacAddr::default();
        dest.0.copy_from_slice(&header[0..6]);
        source.0.copy_from_slice(&header[6..12]);
        let net_proto = u16::from_be_bytes([header[12], header[13]]);
        Ok(LinkHeader {
            dest,
            source,
            net_proto,
        })
    }

    fn mc_hash(&self, net_proto: u16, net_addr: &[u8]) -> MacAddr {
        match net_proto {
            ETH_P_IP => {
                // 01:00:5e + low 23 bits of the group address
                let mut mac = [0x01, 0x00, 0x5e, 0, 0, 0];
                if net_addr.len() >= 4 {
                    mac[3] = net_addr[1] & 0x7f;
                    mac[4] = net_addr[2];
                    mac[5] = net_addr[3];
                }
                MacAddr(mac)
            }
            ETH_P_IPV6 => {
                // 33:33 + low 32 bits of the group address
                let mut mac = [0x33, 0x33, 0, 0, 0, 0];
                if net_addr.len() >= 16 {
                    mac[2..6].copy_from_slice(&net_addr[12..16]);
                }
                MacAddr(mac)
            }
            _ => MacAddr::BROADCAST,
        }
    }

    fn broadcast(&self) -> MacAddr {
        MacAddr::BROADCAST
    }
}

static ETHERNET: Ethernet = Ethernet;

/// The Ethernet link protocol instance
pub fn ethernet() -> &'static dyn LinkProtocol {
    &ETHERNET
}
