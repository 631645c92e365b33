//! # IPv4
//!
//! Addressing, routing, fragmentation and reassembly. Each configured
//! address is a miniroute `(address, netmask, gateway, device)`; route
//! selection prefers the longest matching prefix and falls back to a
//! gateway route, failing with network-unreachable when nothing matches.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr};

use spin::Mutex;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::ticks::{currticks, TICKS_PER_SEC};

use crate::arp;
use crate::ethernet::ETH_P_IP;
use crate::netdev::{self, MacAddr, NetDevice, NetProtocol};
use crate::tcpip;

/// IPv4 header length (no options emitted)
pub const IP_HLEN: usize = 20;

const DEFAULT_TTL: u8 = 64;
const FRAG_MORE: u16 = 0x2000;
const FRAG_OFFSET_MASK: u16 = 0x1fff;

/// Reassembly hold timeout
const REASSEMBLY_TIMEOUT: u64 = 10 * TICKS_PER_SEC;

/// A configured address and its routes
#[derive(Clone)]
pub struct MiniRoute {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dev: Arc<NetDevice>,
}

impl MiniRoute {
    fn matches(&self, dest: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(dest) ^ u32::from(self.address)) & mask == 0
    }

    fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }
}

static ROUTES: Mutex<Vec<MiniRoute>> = Mutex::new(Vec::new());

/// Configure an address on a device
pub fn add_miniroute(
    dev: &Arc<NetDevice>,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
) {
    log::info!(
        "{} address {address}/{netmask}{}",
        dev.name(),
        gateway.map(|g| alloc::format!(" gw {g}")).unwrap_or_default()
    );
    ROUTES.lock().push(MiniRoute {
        address,
        netmask,
        gateway,
        dev: dev.clone(),
    });
}

/// Remove all addresses configured on a device
pub fn del_miniroutes(dev: &NetDevice) {
    ROUTES.lock().retain(|r| r.dev.index() != dev.index());
}

/// All configured miniroutes
pub fn miniroutes() -> Vec<MiniRoute> {
    ROUTES.lock().clone()
}

/// Clear the route table (tests)
pub fn clear_routes() {
    ROUTES.lock().clear();
}

/// Select a route: longest-prefix direct match, else a gateway route
///
/// Returns the miniroute and the next-hop address.
pub fn route(dest: Ipv4Addr) -> Result<(MiniRoute, Ipv4Addr)> {
    let routes = ROUTES.lock();
    let direct = routes
        .iter()
        .filter(|r| r.matches(dest))
        .max_by_key(|r| r.prefix_len());
    if let Some(route) = direct {
        let next_hop = route.gateway.filter(|_| !route.matches(dest)).unwrap_or(dest);
        return Ok((route.clone(), next_hop));
    }
    let via_gateway = routes.iter().find(|r| r.gateway.is_some());
    match via_gateway {
        Some(route) => {
            let gateway = route.gateway.unwrap_or(dest);
            Ok((route.clone(), gateway))
        }
        None => Err(Error::NetUnreachable),
    }
}

/// Source address that a transmission to `dest` will use
pub fn source_for(dest: Ipv4Addr, dev_hint: Option<&Arc<NetDevice>>) -> Ipv4Addr {
    if let Ok((route, _)) = route(dest) {
        return route.address;
    }
    if let Some(dev) = dev_hint {
        let routes = ROUTES.lock();
        if let Some(r) = routes.iter().find(|r| r.dev.index() == dev.index()) {
            return r.address;
        }
    }
    Ipv4Addr::UNSPECIFIED
}

static NEXT_IDENT: Mutex<u16> = Mutex::new(1);

fn next_ident() -> u16 {
    let mut ident = NEXT_IDENT.lock();
    *ident = ident.wrapping_add(1);
    *ident
}

fn build_header(
    buf: &mut [u8],
    len: usize,
    ident: u16,
    frag: u16,
    proto: u8,
    src: Ipv4Addr,
    dest: Ipv4Addr,
) {
    buf[0] = 0x45;
    buf[1] = 0;
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&ident.to_be_bytes());
    buf[6..8].copy_from_slice(&frag.to_be_bytes());
    buf[8] = DEFAULT_TTL;
    buf[9] = proto;
    buf[10..12].copy_from_slice(&[0, 0]);
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dest.octets());
    let csum = tcpip::checksum(&buf[..IP_HLEN]);
    buf[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Hand a framed datagram to the link layer, resolving the destination MAC
fn ll_tx(
    iobuf: IoBuffer,
    dev: &Arc<NetDevice>,
    dest: Ipv4Addr,
    next_hop: Ipv4Addr,
) -> Result<()> {
    if dest.is_broadcast() {
        return netdev::net_tx(iobuf, dev, ETH_P_IP, dev.link_protocol().broadcast());
    }
    if dest.is_multicast() {
        let mac = dev.link_protocol().mc_hash(ETH_P_IP, &dest.octets());
        return netdev::net_tx(iobuf, dev, ETH_P_IP, mac);
    }
    arp::tx(iobuf, dev, &next_hop.octets())
}

/// Transmit a transport payload
///
/// The buffer holds the transport header and payload; the transport has
/// already filled in its checksum (the pseudo-header covers `src`/`dest`).
/// Fragments when the datagram exceeds the device MTU.
pub fn tx(
    mut iobuf: IoBuffer,
    proto: u8,
    src: Ipv4Addr,
    dest: Ipv4Addr,
    dev_hint: Option<&Arc<NetDevice>>,
) -> Result<()> {
    let (dev, next_hop) = if dest.is_broadcast() || dest.is_multicast() {
        let dev = dev_hint
            .cloned()
            .or_else(|| netdev::net_devices().into_iter().find(|d| d.is_open()))
            .ok_or(Error::NetUnreachable)?;
        (dev, dest)
    } else {
        let (route, next_hop) = route(dest)?;
        (route.dev, next_hop)
    };

    let ident = next_ident();
    let mtu = dev.mtu();
    if IP_HLEN + iobuf.len() <= mtu {
        let len = IP_HLEN + iobuf.len();
        let header = iobuf.push(IP_HLEN)?;
        build_header(header, len, ident, 0, proto, src, dest);
        return ll_tx(iobuf, &dev, dest, next_hop);
    }

    // Fragment: payload chunks aligned to 8 bytes
    let chunk = (mtu - IP_HLEN) & !7;
    if chunk == 0 {
        return Err(Error::InvalidArgument);
    }
    let payload = iobuf.as_ref().to_vec();
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk).min(payload.len());
        let more = end < payload.len();
        let mut frag = IoBuffer::alloc(IP_HLEN + (end - offset));
        frag.extend_from_slice(&payload[offset..end])?;
        let len = IP_HLEN + (end - offset);
        let frag_field =
            ((offset / 8) as u16 & FRAG_OFFSET_MASK) | if more { FRAG_MORE } else { 0 };
        let header = frag.push(IP_HLEN)?;
        build_header(header, len, ident, frag_field, proto, src, dest);
        ll_tx(frag, &dev, dest, next_hop)?;
        offset = end;
    }
    Ok(())
}

// ============================================================================
// Reassembly
// ============================================================================

struct Reassembly {
    src: Ipv4Addr,
    ident: u16,
    proto: u8,
    /// Accumulated payload; fragments must arrive in order
    data: Vec<u8>,
    started: u64,
}

static REASSEMBLIES: Mutex<Vec<Reassembly>> = Mutex::new(Vec::new());

/// Fold a fragment into the reassembly queue
///
/// Returns the complete payload once the final fragment lands. Fragments
/// arriving out of order discard the partial datagram (matching the
/// original's in-order-only reassembly); stale entries age out.
fn reassemble(
    src: Ipv4Addr,
    ident: u16,
    proto: u8,
    frag_field: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let offset = usize::from(frag_field & FRAG_OFFSET_MASK) * 8;
    let more = frag_field & FRAG_MORE != 0;
    let now = currticks();

    let mut queue = REASSEMBLIES.lock();
    queue.retain(|r| now.wrapping_sub(r.started) < REASSEMBLY_TIMEOUT);

    let position = queue
        .iter()
        .position(|r| r.src == src && r.ident == ident && r.proto == proto);
    match position {
        None if offset == 0 && more => {
            queue.push(Reassembly {
                src,
                ident,
                proto,
                data: payload.to_vec(),
                started: now,
            });
            None
        }
        None => None,
        Some(index) => {
            if queue[index].data.len() != offset {
                // Out of order: abandon
                queue.remove(index);
                return None;
            }
            queue[index].data.extend_from_slice(payload);
            if more {
                None
            } else {
                Some(queue.remove(index).data)
            }
        }
    }
}

/// True if `dest` is addressed to us on `dev`
fn is_ours(dest: Ipv4Addr, dev: &NetDevice) -> bool {
    if dest.is_broadcast() || dest.is_multicast() {
        return true;
    }
    let routes = ROUTES.lock();
    let mut has_addr = false;
    for route in routes.iter().filter(|r| r.dev.index() == dev.index()) {
        has_addr = true;
        if route.address == dest {
            return true;
        }
        // Subnet-directed broadcast
        let mask = u32::from(route.netmask);
        if mask != 0 && u32::from(dest) == (u32::from(route.address) & mask) | !mask {
            return true;
        }
    }
    // An unconfigured interface accepts everything (a DHCP ACK can be
    // unicast to the address it is in the middle of assigning)
    !has_addr
}

/// Receive handler registered by ethertype
fn rx(mut iobuf: IoBuffer, dev: &Arc<NetDevice>, _ll_dest: MacAddr, _ll_source: MacAddr) -> Result<()> {
    let data = iobuf.as_ref();
    if data.len() < IP_HLEN {
        return Err(Error::Protocol);
    }
    let version = data[0] >> 4;
    let ihl = usize::from(data[0] & 0x0f) * 4;
    if version != 4 || ihl < IP_HLEN || data.len() < ihl {
        return Err(Error::Protocol);
    }
    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if total_len < ihl || total_len > data.len() {
        return Err(Error::Protocol);
    }
    if tcpip::checksum(&data[..ihl]) != 0 {
        log::debug!("{} bad IPv4 header checksum", dev.name());
        return Err(Error::Protocol);
    }
    let ident = u16::from_be_bytes([data[4], data[5]]);
    let frag_field = u16::from_be_bytes([data[6], data[7]]);
    let proto = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dest = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    if !is_ours(dest, dev) {
        return Ok(());
    }

    // Trim link-layer padding, strip the header
    let trim = iobuf.len() - total_len;
    if trim > 0 {
        iobuf.unput(trim)?;
    }
    iobuf.pull(ihl)?;

    if frag_field & (FRAG_MORE | FRAG_OFFSET_MASK) != 0 {
        let Some(complete) = reassemble(src, ident, proto, frag_field, iobuf.as_ref()) else {
            return Ok(());
        };
        let mut full = IoBuffer::alloc(complete.len());
        full.extend_from_slice(&complete)?;
        let sum = tcpip::pshdr_sum(IpAddr::V4(src), IpAddr::V4(dest), proto, full.len());
        return tcpip::tcpip_rx(full, proto, IpAddr::V4(src), IpAddr::V4(dest), sum);
    }

    let sum = tcpip::pshdr_sum(IpAddr::V4(src), IpAddr::V4(dest), proto, iobuf.len());
    tcpip::tcpip_rx(iobuf, proto, IpAddr::V4(src), IpAddr::V4(dest), sum)
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        netdev::register_net_protocol(NetProtocol {
            name: "IP",
            net_proto: ETH_P_IP,
            rx,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::MockDevice;

    #[test]
    fn longest_prefix_route_wins() {
        let _guard = crate::TEST_MUTEX.lock();
        clear_routes();
        let (_mock, dev_a) = MockDevice::create();
        let (_mock2, dev_b) = MockDevice::create();
        add_miniroute(&dev_a, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0), None);
        add_miniroute(&dev_b, Ipv4Addr::new(10, 0, 2, 15), Ipv4Addr::new(255, 255, 255, 0),
                      Some(Ipv4Addr::new(10, 0, 2, 2)));

        let (matched_route, next_hop) = route(Ipv4Addr::new(10, 0, 2, 99)).unwrap();
        assert_eq!(matched_route.dev.index(), dev_b.index());
        assert_eq!(next_hop, Ipv4Addr::new(10, 0, 2, 99));

        // Off-subnet traffic goes to the gateway
        let (matched_route, next_hop) = route(Ipv4Addr::new(192, 0, 2, 1)).unwrap();
        assert_eq!(matched_route.dev.index(), dev_b.index());
        assert_eq!(next_hop, Ipv4Addr::new(10, 0, 2, 2));

        clear_routes();
        NetDevice::unregister(&dev_a);
        NetDevice::unregister(&dev_b);
    }

    #[test]
    fn no_route_is_unreachable() {
        let _guard = crate::TEST_MUTEX.lock();
        clear_routes();
        assert_eq!(
            route(Ipv4Addr::new(203, 0, 113, 1)).err(),
            Some(Error::NetUnreachable)
        );
    }

    #[test]
    fn broadcast_tx_uses_ll_broadcast() {
        let _guard = crate::TEST_MUTEX.lock();
        clear_routes();
        let (mock, dev) = MockDevice::create();
        dev.open().unwrap();

        let mut iob = IoBuffer::alloc(8);
        iob.extend_from_slice(b"dhcpdata").unwrap();
        tx(iob, tcpip::IP_UDP, Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, Some(&dev)).unwrap();

        let frame = mock.pop_sent().unwrap();
        assert_eq!(&frame[0..6], &[0xff; 6]);
        // Ethertype
        assert_eq!(&frame[12..14], &ETH_P_IP.to_be_bytes());
        // IPv4 header begins after the Ethernet header
        assert_eq!(frame[14] >> 4, 4);
        assert_eq!(&frame[14 + 16..14 + 20], &[255, 255, 255, 255]);

        clear_routes();
        NetDevice::unregister(&dev);
    }

    #[test]
    fn fragmentation_and_reassembly_round_trip() {
        let _guard = crate::TEST_MUTEX.lock();
        // Build a 100-byte payload fragmented at 64-byte chunks
        let payload: Vec<u8> = (0..100u8).collect();
        let src = Ipv4Addr::new(10, 0, 2, 1);
        let first = reassemble(src, 7, 17, FRAG_MORE, &payload[..64]);
        assert!(first.is_none());
        let rest = reassemble(src, 7, 17, 64 / 8, &payload[64..]);
        assert_eq!(rest.unwrap(), payload);
    }

    #[test]
    fn out_of_order_fragment_abandons() {
        let _guard = crate::TEST_MUTEX.lock();
        let src = Ipv4Addr::new(10, 0, 2, 9);
        assert!(reassemble(src, 8, 17, FRAG_MORE, &[0; 16]).is_none());
        // Offset skips ahead: entry abandoned
        assert!(reassemble(src, 8, 17, 64 / 8, &[0; 8]).is_none());
        // Even the correctly-offset final fragment now finds nothing
        assert!(reassemble(src, 8, 17, 16 / 8, &[0; 8]).is_none());
    }
}
