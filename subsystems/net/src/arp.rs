//! ARP (RFC 826) over the shared neighbour cache.
//!
//! Requests go to the link broadcast address with the cache's exponential
//! backoff (125 ms up to 3 s); replies and gratuitous requests update the
//! cache, and requests for one of our configured addresses are answered.

use alloc::sync::Arc;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;

use crate::ethernet::{ETH_P_ARP, ETH_P_IP};
use crate::ipv4;
use crate::neighbour::{self, NeighbourDiscovery};
use crate::netdev::{self, MacAddr, NetDevice, NetProtocol};

/// ARP operation codes
const ARP_REQUEST: u16 = 1;
const ARP_REPLY: u16 = 2;

/// Ethernet/IPv4 ARP packet length
const ARP_LEN: usize = 28;

struct ArpDiscovery;

fn build(
    op: u16,
    sender_mac: MacAddr,
    sender_ip: &[u8; 4],
    target_mac: MacAddr,
    target_ip: &[u8; 4],
) -> Result<IoBuffer> {
    let mut iobuf = IoBuffer::alloc(ARP_LEN);
    let buf = iobuf.put(ARP_LEN)?;
    buf[0..2].copy_from_slice(&1u16.to_be_bytes()); // hardware: ethernet
    buf[2..4].copy_from_slice(&ETH_P_IP.to_be_bytes()); // protocol: IPv4
    buf[4] = 6; // hardware address length
    buf[5] = 4; // protocol address length
    buf[6..8].copy_from_slice(&op.to_be_bytes());
    buf[8..14].copy_from_slice(&sender_mac.0);
    buf[14..18].copy_from_slice(sender_ip);
    buf[18..24].copy_from_slice(&target_mac.0);
    buf[24..28].copy_from_slice(target_ip);
    Ok(iobuf)
}

impl NeighbourDiscovery for ArpDiscovery {
    fn name(&self) -> &'static str {
        "ARP"
    }

    fn solicit(&self, dev: &Arc<NetDevice>, net_addr: &[u8]) -> Result<()> {
        let target: [u8; 4] = net_addr.try_into().map_err(|_| Error::InvalidArgument)?;
        let source = ipv4::source_for(target.into(), Some(dev));
        let iobuf = build(
            ARP_REQUEST,
            dev.ll_addr(),
            &source.octets(),
            MacAddr::default(),
            &target,
        )?;
        netdev::net_tx(iobuf, dev, ETH_P_ARP, dev.link_protocol().broadcast())
    }
}

/// Transmit an IPv4 packet, resolving the next hop through ARP
pub fn tx(iobuf: IoBuffer, dev: &Arc<NetDevice>, next_hop: &[u8]) -> Result<()> {
    neighbour::tx(iobuf, dev, ETH_P_IP, next_hop, Arc::new(ArpDiscovery))
}

/// Receive handler for ethertype 0x0806
fn rx(mut iobuf: IoBuffer, dev: &Arc<NetDevice>, _ll_dest: MacAddr, _ll_source: MacAddr) -> Result<()> {
    let data = iobuf.as_ref();
    if data.len() < ARP_LEN {
        return Err(Error::Protocol);
    }
    let hw_type = u16::from_be_bytes([data[0], data[1]]);
    let proto_type = u16::from_be_bytes([data[2], data[3]]);
    if hw_type != 1 || proto_type != ETH_P_IP || data[4] != 6 || data[5] != 4 {
        return Ok(());
    }
    let op = u16::from_be_bytes([data[6], data[7]]);
    let mut sender_mac = MacAddr::default();
    sender_mac.0.copy_from_slice(&data[8..14]);
    let sender_ip: [u8; 4] = data[14..18].try_into().unwrap_or_default();
    let target_ip: [u8; 4] = data[24..28].try_into().unwrap_or_default();

    // Any sighting of the sender refreshes the cache
    neighbour::update(dev, ETH_P_IP, &sender_ip, sender_mac);

    if op != ARP_REQUEST {
        return Ok(());
    }

    // Answer requests for our own addresses
    let target_addr = core::net::Ipv4Addr::from(target_ip);
    let ours = ipv4::miniroutes()
        .iter()
        .any(|r| r.dev.index() == dev.index() && r.address == target_addr);
    if !ours {
        return Ok(());
    }

    iobuf.pull(ARP_LEN)?;
    let reply = build(ARP_REPLY, dev.ll_addr(), &target_ip, sender_mac, &sender_ip)?;
    log::debug!("{} answering ARP for {}", dev.name(), target_addr);
    netdev::net_tx(reply, dev, ETH_P_ARP, sender_mac)
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        netdev::register_net_protocol(NetProtocol {
            name: "ARP",
            net_proto: ETH_P_ARP,
            rx,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;

    #[test]
    fn request_format() {
        let iobuf = build(
            ARP_REQUEST,
            MacAddr([1, 2, 3, 4, 5, 6]),
            &[10, 0, 2, 15],
            MacAddr::default(),
            &[10, 0, 2, 2],
        )
        .unwrap();
        let b = iobuf.as_ref();
        assert_eq!(b.len(), ARP_LEN);
        assert_eq!(&b[0..8], &[0, 1, 0x08, 0x00, 6, 4, 0, 1]);
        assert_eq!(&b[8..14], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&b[14..18], &[10, 0, 2, 15]);
        assert_eq!(&b[24..28], &[10, 0, 2, 2]);
    }

    #[test]
    fn reply_updates_cache() {
        let _guard = crate::TEST_MUTEX.lock();
        neighbour::clear();
        let (_mock, dev) = crate::netdev::MockDevice::create();
        dev.open().unwrap();

        let reply = build(
            ARP_REPLY,
            MacAddr([0xaa; 6]),
            &[10, 0, 2, 2],
            dev.ll_addr(),
            &[10, 0, 2, 15],
        )
        .unwrap();
        rx(reply, &dev, dev.ll_addr(), MacAddr([0xaa; 6])).unwrap();

        // An unsolicited reply does not create an entry, but it would have
        // refreshed one; create then refresh
        assert!(neighbour::lookup(&dev, ETH_P_IP, &[10, 0, 2, 2]).is_none());

        tx(IoBuffer::from_slice(b"ip"), &dev, &[10, 0, 2, 2]).unwrap();
        let reply = build(
            ARP_REPLY,
            MacAddr([0xaa; 6]),
            &[10, 0, 2, 2],
            dev.ll_addr(),
            &[10, 0, 2, 15],
        )
        .unwrap();
        rx(reply, &dev, dev.ll_addr(), MacAddr([0xaa; 6])).unwrap();
        assert_eq!(
            neighbour::lookup(&dev, ETH_P_IP, &[10, 0, 2, 2]),
            Some(MacAddr([0xaa; 6]))
        );

        crate::netdev::NetDevice::unregister(&dev);
        neighbour::clear();
    }

    #[test]
    fn answers_request_for_our_address() {
        let _guard = crate::TEST_MUTEX.lock();
        let (mock, dev) = crate::netdev::MockDevice::create();
        dev.open().unwrap();
        ipv4::add_miniroute(&dev, Ipv4Addr::new(10, 0, 2, 15), Ipv4Addr::new(255, 255, 255, 0), None);

        let request = build(
            ARP_REQUEST,
            MacAddr([0xbb; 6]),
            &[10, 0, 2, 2],
            MacAddr::default(),
            &[10, 0, 2, 15],
        )
        .unwrap();
        rx(request, &dev, MacAddr::BROADCAST, MacAddr([0xbb; 6])).unwrap();

        let frame = mock.pop_sent().unwrap();
        // Ethernet dest = requester, ARP op = reply
        assert_eq!(&frame[0..6], &[0xbb; 6]);
        assert_eq!(u16::from_be_bytes([frame[14 + 6], frame[14 + 7]]), ARP_REPLY);

        ipv4::del_miniroutes(&dev);
        crate::netdev::NetDevice::unregister(&dev);
    }
}
