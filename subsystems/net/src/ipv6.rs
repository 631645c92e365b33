//! # IPv6
//!
//! Addressing, routing and SLAAC. Addresses are synthesised from router
//! advertisements (prefix + interface identifier derived from the link
//! address) or configured as link-locals when a device opens. Transmit
//! never fragments; oversized datagrams are the transport's problem.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{IpAddr, Ipv6Addr};

use spin::Mutex;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;

use crate::ethernet::ETH_P_IPV6;
use crate::ndp;
use crate::netdev::{self, MacAddr, NetDevice, NetProtocol};
use crate::tcpip;

/// IPv6 header length
pub const IP6_HLEN: usize = 40;

const DEFAULT_HOP_LIMIT: u8 = 64;

/// A configured address with its prefix and optional default router
#[derive(Clone)]
pub struct MiniRoute6 {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub router: Option<Ipv6Addr>,
    pub dev: Arc<NetDevice>,
}

impl MiniRoute6 {
    fn matches(&self, dest: Ipv6Addr) -> bool {
        let bits = u128::from_be_bytes(self.address.octets())
            ^ u128::from_be_bytes(dest.octets());
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(self.prefix_len))
        };
        bits & mask == 0
    }
}

static ROUTES: Mutex<Vec<MiniRoute6>> = Mutex::new(Vec::new());

/// Derive the modified EUI-64 interface identifier from a MAC address
pub fn eui64(mac: MacAddr) -> [u8; 8] {
    [
        mac.0[0] ^ 0x02,
        mac.0[1],
        mac.0[2],
        0xff,
        0xfe,
        mac.0[3],
        mac.0[4],
        mac.0[5],
    ]
}

/// The link-local address of a device
pub fn link_local(dev: &NetDevice) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8..16].copy_from_slice(&eui64(dev.ll_addr()));
    Ipv6Addr::from(octets)
}

/// The solicited-node multicast group of an address
pub fn solicited_node(addr: Ipv6Addr) -> Ipv6Addr {
    let target = addr.octets();
    let mut octets = [0u8; 16];
    octets[0] = 0xff;
    octets[1] = 0x02;
    octets[11] = 0x01;
    octets[12] = 0xff;
    octets[13..16].copy_from_slice(&target[13..16]);
    Ipv6Addr::from(octets)
}

/// Configure the link-local address for a device (idempotent)
pub fn ensure_link_local(dev: &Arc<NetDevice>) {
    let address = link_local(dev);
    let mut routes = ROUTES.lock();
    if routes
        .iter()
        .any(|r| r.dev.index() == dev.index() && r.address == address)
    {
        return;
    }
    routes.push(MiniRoute6 {
        address,
        prefix_len: 64,
        router: None,
        dev: dev.clone(),
    });
}

/// Stateless address autoconfiguration from a router advertisement prefix
///
/// Synthesises `prefix | interface-id`, installs the subnet route, and a
/// default route via `router` when its lifetime is nonzero.
pub fn slaac(
    dev: &Arc<NetDevice>,
    prefix: Ipv6Addr,
    prefix_len: u8,
    router: Ipv6Addr,
    router_lifetime: u16,
) {
    if prefix_len != 64 {
        log::debug!("{} ignoring /{} SLAAC prefix", dev.name(), prefix_len);
        return;
    }
    let mut octets = prefix.octets();
    octets[8..16].copy_from_slice(&eui64(dev.ll_addr()));
    let address = Ipv6Addr::from(octets);
    let router = (router_lifetime > 0).then_some(router);

    let mut routes = ROUTES.lock();
    if let Some(existing) = routes
        .iter_mut()
        .find(|r| r.dev.index() == dev.index() && r.address == address)
    {
        existing.router = router.or(existing.router);
        return;
    }
    log::info!("{} SLAAC address {address}", dev.name());
    routes.push(MiniRoute6 {
        address,
        prefix_len,
        router,
        dev: dev.clone(),
    });
}

/// Remove all addresses configured on a device
pub fn del_miniroutes(dev: &NetDevice) {
    ROUTES.lock().retain(|r| r.dev.index() != dev.index());
}

/// All configured miniroutes
pub fn miniroutes() -> Vec<MiniRoute6> {
    ROUTES.lock().clone()
}

/// Clear the route table (tests)
pub fn clear_routes() {
    ROUTES.lock().clear();
}

/// Select a route: longest matching prefix, else a default router
pub fn route(dest: Ipv6Addr) -> Result<(MiniRoute6, Ipv6Addr)> {
    let routes = ROUTES.lock();
    let direct = routes
        .iter()
        .filter(|r| r.matches(dest))
        .max_by_key(|r| r.prefix_len);
    if let Some(route) = direct {
        return Ok((route.clone(), dest));
    }
    let via_router = routes.iter().find(|r| r.router.is_some());
    match via_router {
        Some(route) => {
            let router = route.router.unwrap_or(dest);
            Ok((route.clone(), router))
        }
        None => Err(Error::NetUnreachable),
    }
}

/// Source address for a destination
pub fn source_for(dest: Ipv6Addr, dev_hint: Option<&Arc<NetDevice>>) -> Ipv6Addr {
    if let Ok((route, _)) = route(dest) {
        return route.address;
    }
    if let Some(dev) = dev_hint {
        return link_local(dev);
    }
    Ipv6Addr::UNSPECIFIED
}

fn build_header(buf: &mut [u8], payload_len: usize, proto: u8, src: Ipv6Addr, dest: Ipv6Addr) {
    buf[0] = 0x60;
    buf[1] = 0;
    buf[2] = 0;
    buf[3] = 0;
    buf[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    buf[6] = proto;
    buf[7] = DEFAULT_HOP_LIMIT;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dest.octets());
}

/// Transmit a transport payload over IPv6
pub fn tx(
    mut iobuf: IoBuffer,
    proto: u8,
    src: Ipv6Addr,
    dest: Ipv6Addr,
    dev_hint: Option<&Arc<NetDevice>>,
) -> Result<()> {
    let payload_len = iobuf.len();
    if dest.is_multicast() {
        let dev = dev_hint
            .cloned()
            .or_else(|| netdev::net_devices().into_iter().find(|d| d.is_open()))
            .ok_or(Error::NetUnreachable)?;
        let header = iobuf.push(IP6_HLEN)?;
        build_header(header, payload_len, proto, src, dest);
        let mac = dev.link_protocol().mc_hash(ETH_P_IPV6, &dest.octets());
        return netdev::net_tx(iobuf, &dev, ETH_P_IPV6, mac);
    }

    let (route, next_hop) = route(dest)?;
    let header = iobuf.push(IP6_HLEN)?;
    build_header(header, payload_len, proto, src, dest);
    ndp::tx(iobuf, &route.dev, &next_hop.octets())
}

/// True if `dest` is addressed to us on `dev`
fn is_ours(dest: Ipv6Addr, dev: &NetDevice) -> bool {
    if dest.is_multicast() {
        return true;
    }
    if dest == link_local(dev) {
        return true;
    }
    ROUTES
        .lock()
        .iter()
        .any(|r| r.dev.index() == dev.index() && r.address == dest)
}

fn rx(mut iobuf: IoBuffer, dev: &Arc<NetDevice>, _ll_dest: MacAddr, _ll_source: MacAddr) -> Result<()> {
    let data = iobuf.as_ref();
    if data.len() < IP6_HLEN || data[0] >> 4 != 6 {
        return Err(Error::Protocol);
    }
    let payload_len = usize::from(u16::from_be_bytes([data[4], data[5]]));
    if IP6_HLEN + payload_len > data.len() {
        return Err(Error::Protocol);
    }
    let proto = data[6];
    let mut src_octets = [0u8; 16];
    src_octets.copy_from_slice(&data[8..24]);
    let src = Ipv6Addr::from(src_octets);
    let mut dest_octets = [0u8; 16];
    dest_octets.copy_from_slice(&data[24..40]);
    let dest = Ipv6Addr::from(dest_octets);

    if !is_ours(dest, dev) {
        return Ok(());
    }

    // Trim padding, strip header
    let trim = iobuf.len() - (IP6_HLEN + payload_len);
    if trim > 0 {
        iobuf.unput(trim)?;
    }
    iobuf.pull(IP6_HLEN)?;

    // Extension headers are not processed; a fragment header in a boot
    // flow means someone is sending us something we never asked for
    if proto == 44 {
        log::debug!("{} dropping fragmented IPv6 datagram", dev.name());
        return Ok(());
    }

    let sum = tcpip::pshdr_sum(IpAddr::V6(src), IpAddr::V6(dest), proto, iobuf.len());
    if proto == tcpip::IP_ICMP6 {
        return ndp::icmp6_rx(iobuf, dev, src, dest, sum);
    }
    tcpip::tcpip_rx(iobuf, proto, IpAddr::V6(src), IpAddr::V6(dest), sum)
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        netdev::register_net_protocol(NetProtocol {
            name: "IPv6",
            net_proto: ETH_P_IPV6,
            rx,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::MockDevice;

    #[test]
    fn eui64_flips_universal_bit() {
        let mac = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        assert_eq!(eui64(mac), [0x50, 0x54, 0x00, 0xff, 0xfe, 0x12, 0x34, 0x56]);
    }

    #[test]
    fn solicited_node_group() {
        let addr: Ipv6Addr = "fe80::5054:ff:fe12:3456".parse().unwrap();
        let group = solicited_node(addr);
        assert_eq!(group, "ff02::1:ff12:3456".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn slaac_installs_address_and_router() {
        let _guard = crate::TEST_MUTEX.lock();
        clear_routes();
        let (_mock, dev) = MockDevice::create();
        let prefix: Ipv6Addr = "2001:db8:1::".parse().unwrap();
        let router: Ipv6Addr = "fe80::1".parse().unwrap();
        slaac(&dev, prefix, 64, router, 1800);

        let routes = miniroutes();
        assert_eq!(routes.len(), 1);
        let expected: Ipv6Addr = "2001:db8:1::5054:ff:fe12:3456".parse().unwrap();
        assert_eq!(routes[0].address, expected);
        assert_eq!(routes[0].router, Some(router));

        // On-link destinations route directly; off-link via the router
        let (_, next_hop) = route("2001:db8:1::42".parse().unwrap()).unwrap();
        assert_eq!(next_hop, "2001:db8:1::42".parse::<Ipv6Addr>().unwrap());
        let (_, next_hop) = route("2606:4700::1".parse().unwrap()).unwrap();
        assert_eq!(next_hop, router);

        clear_routes();
        NetDevice::unregister(&dev);
    }

    #[test]
    fn zero_router_lifetime_means_no_default_route() {
        let _guard = crate::TEST_MUTEX.lock();
        clear_routes();
        let (_mock, dev) = MockDevice::create();
        slaac(&dev, "2001:db8:2::".parse().unwrap(), 64, "fe80::1".parse().unwrap(), 0);
        assert!(route("2606:4700::1".parse().unwrap()).is_err());
        clear_routes();
        NetDevice::unregister(&dev);
    }
}
