//! # NDP (RFC 4861/4862) and ICMPv6
//!
//! Neighbour solicitations go to the solicited-node multicast group of the
//! target; advertisements feed the shared neighbour cache. Router
//! advertisements drive SLAAC: a prefix option with the on-link and
//! autonomous flags set synthesises an address, and a nonzero router
//! lifetime installs a default route.

use alloc::sync::Arc;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;

use crate::ethernet::ETH_P_IPV6;
use crate::ipv6;
use crate::neighbour::{self, NeighbourDiscovery};
use crate::netdev::{self, MacAddr, NetDevice};
use crate::tcpip;

// ICMPv6 types
const ICMP6_ECHO_REQUEST: u8 = 128;
const ICMP6_ECHO_REPLY: u8 = 129;
const ICMP6_ROUTER_ADVERT: u8 = 134;
const ICMP6_NEIGHBOUR_SOLICIT: u8 = 135;
const ICMP6_NEIGHBOUR_ADVERT: u8 = 136;

// NDP option types
const NDP_OPT_SOURCE_LL: u8 = 1;
const NDP_OPT_TARGET_LL: u8 = 2;
const NDP_OPT_PREFIX: u8 = 3;

/// Fill in the ICMPv6 checksum over the pseudo-header and message
fn finalize_checksum(message: &mut [u8], src: core::net::Ipv6Addr, dest: core::net::Ipv6Addr) {
    message[2..4].copy_from_slice(&[0, 0]);
    let sum = tcpip::pshdr_sum(src.into(), dest.into(), tcpip::IP_ICMP6, message.len());
    let csum = tcpip::checksum_final(tcpip::checksum_partial(sum, message));
    message[2..4].copy_from_slice(&csum.to_be_bytes());
}

struct NdpDiscovery;

impl NeighbourDiscovery for NdpDiscovery {
    fn name(&self) -> &'static str {
        "NDP"
    }

    fn solicit(&self, dev: &Arc<NetDevice>, net_addr: &[u8]) -> Result<()> {
        let target: [u8; 16] = net_addr.try_into().map_err(|_| Error::InvalidArgument)?;
        let target = core::net::Ipv6Addr::from(target);
        let src = ipv6::link_local(dev);
        let dest = ipv6::solicited_node(target);

        // NS: type code csum reserved(4) target(16) + source-ll option
        let mut iobuf = IoBuffer::alloc(32);
        let msg = iobuf.put(32)?;
        msg[0] = ICMP6_NEIGHBOUR_SOLICIT;
        msg[8..24].copy_from_slice(&target.octets());
        msg[24] = NDP_OPT_SOURCE_LL;
        msg[25] = 1;
        msg[26..32].copy_from_slice(&dev.ll_addr().0);
        finalize_checksum(msg, src, dest);

        let payload_len = iobuf.len();
        let header = iobuf.push(ipv6::IP6_HLEN)?;
        build_ip6(header, payload_len, src, dest);
        let mac = dev.link_protocol().mc_hash(ETH_P_IPV6, &dest.octets());
        netdev::net_tx(iobuf, dev, ETH_P_IPV6, mac)
    }
}

fn build_ip6(buf: &mut [u8], payload_len: usize, src: core::net::Ipv6Addr, dest: core::net::Ipv6Addr) {
    buf[0] = 0x60;
    buf[1] = 0;
    buf[2] = 0;
    buf[3] = 0;
    buf[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    buf[6] = tcpip::IP_ICMP6;
    // Hop limit 255 is mandatory for NDP
    buf[7] = 255;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dest.octets());
}

/// Transmit an IPv6 datagram, resolving the next hop through NDP
pub fn tx(iobuf: IoBuffer, dev: &Arc<NetDevice>, next_hop: &[u8]) -> Result<()> {
    neighbour::tx(iobuf, dev, ETH_P_IPV6, next_hop, Arc::new(NdpDiscovery))
}

/// Send a neighbour advertisement answering `solicit_src`
fn send_advert(
    dev: &Arc<NetDevice>,
    target: core::net::Ipv6Addr,
    dest: core::net::Ipv6Addr,
) -> Result<()> {
    let src = target;
    let mut iobuf = IoBuffer::alloc(32);
    let msg = iobuf.put(32)?;
    msg[0] = ICMP6_NEIGHBOUR_ADVERT;
    // Solicited + override flags
    msg[4] = 0x60;
    msg[8..24].copy_from_slice(&target.octets());
    msg[24] = NDP_OPT_TARGET_LL;
    msg[25] = 1;
    msg[26..32].copy_from_slice(&dev.ll_addr().0);
    finalize_checksum(msg, src, dest);

    let payload_len = iobuf.len();
    let header = iobuf.push(ipv6::IP6_HLEN)?;
    build_ip6(header, payload_len, src, dest);
    tx(iobuf, dev, &dest.octets())
}

/// Process a router advertisement's options
fn process_ra(dev: &Arc<NetDevice>, src: core::net::Ipv6Addr, message: &[u8]) {
    if message.len() < 16 {
        return;
    }
    let router_lifetime = u16::from_be_bytes([message[6], message[7]]);
    let mut options = &message[16..];
    while options.len() >= 8 {
        let opt_type = options[0];
        let opt_len = usize::from(options[1]) * 8;
        if opt_len == 0 || opt_len > options.len() {
            break;
        }
        if opt_type == NDP_OPT_PREFIX && opt_len >= 32 {
            let prefix_len = options[2];
            let flags = options[3];
            let valid_lifetime =
                u32::from_be_bytes([options[4], options[5], options[6], options[7]]);
            // On-link + autonomous with a live prefix drives SLAAC
            if flags & 0xc0 == 0xc0 && valid_lifetime > 0 {
                let mut prefix = [0u8; 16];
                prefix.copy_from_slice(&options[16..32]);
                ipv6::slaac(
                    dev,
                    core::net::Ipv6Addr::from(prefix),
                    prefix_len,
                    src,
                    router_lifetime,
                );
            }
        }
        if opt_type == NDP_OPT_SOURCE_LL && opt_len >= 8 {
            let mut mac = MacAddr::default();
            mac.0.copy_from_slice(&options[2..8]);
            neighbour::update(dev, ETH_P_IPV6, &src.octets(), mac);
        }
        options = &options[opt_len..];
    }
}

/// ICMPv6 receive entry point, called by the IPv6 layer
pub fn icmp6_rx(
    iobuf: IoBuffer,
    dev: &Arc<NetDevice>,
    src: core::net::Ipv6Addr,
    dest: core::net::Ipv6Addr,
    pshdr_sum: u32,
) -> Result<()> {
    let message = iobuf.as_ref();
    if message.len() < 4 {
        return Err(Error::Protocol);
    }
    if tcpip::checksum_final(tcpip::checksum_partial(pshdr_sum, message)) != 0 {
        log::debug!("{} bad ICMPv6 checksum", dev.name());
        return Err(Error::Protocol);
    }

    match message[0] {
        ICMP6_ECHO_REQUEST => {
            let mut reply = IoBuffer::alloc(message.len());
            reply.extend_from_slice(message)?;
            let msg = reply.as_mut();
            msg[0] = ICMP6_ECHO_REPLY;
            finalize_checksum(msg, dest, src);
            ipv6::tx(reply, tcpip::IP_ICMP6, dest, src, Some(dev))
        }
        ICMP6_NEIGHBOUR_SOLICIT => {
            if message.len() < 24 {
                return Err(Error::Protocol);
            }
            let mut target = [0u8; 16];
            target.copy_from_slice(&message[8..24]);
            let target = core::net::Ipv6Addr::from(target);
            let ours = target == ipv6::link_local(dev)
                || ipv6::miniroutes()
                    .iter()
                    .any(|r| r.dev.index() == dev.index() && r.address == target);
            // Learn the soliciting node's address from its option en route
            process_ns_source(dev, src, &message[24..]);
            if ours {
                send_advert(dev, target, src)?;
            }
            Ok(())
        }
        ICMP6_NEIGHBOUR_ADVERT => {
            if message.len() < 24 {
                return Err(Error::Protocol);
            }
            let mut target = [0u8; 16];
            target.copy_from_slice(&message[8..24]);
            let mut options = &message[24..];
            while options.len() >= 8 {
                let opt_len = usize::from(options[1]) * 8;
                if opt_len == 0 || opt_len > options.len() {
                    break;
                }
                if options[0] == NDP_OPT_TARGET_LL {
                    let mut mac = MacAddr::default();
                    mac.0.copy_from_slice(&options[2..8]);
                    neighbour::update(dev, ETH_P_IPV6, &target, mac);
                }
                options = &options[opt_len..];
            }
            Ok(())
        }
        ICMP6_ROUTER_ADVERT => {
            process_ra(dev, src, message);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn process_ns_source(dev: &Arc<NetDevice>, src: core::net::Ipv6Addr, mut options: &[u8]) {
    while options.len() >= 8 {
        let opt_len = usize::from(options[1]) * 8;
        if opt_len == 0 || opt_len > options.len() {
            break;
        }
        if options[0] == NDP_OPT_SOURCE_LL {
            let mut mac = MacAddr::default();
            mac.0.copy_from_slice(&options[2..8]);
            neighbour::update(dev, ETH_P_IPV6, &src.octets(), mac);
        }
        options = &options[opt_len..];
    }
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        // ICMPv6 is dispatched directly by the IPv6 layer; nothing to
        // register beyond ensuring the module is linked
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::MockDevice;
    use alloc::string::ToString;
    use core::net::Ipv6Addr;

    fn icmp6(src: Ipv6Addr, dest: Ipv6Addr, body: &mut [u8]) -> (IoBuffer, u32) {
        finalize_checksum(body, src, dest);
        let sum = tcpip::pshdr_sum(src.into(), dest.into(), tcpip::IP_ICMP6, body.len());
        let mut iob = IoBuffer::alloc(body.len());
        iob.extend_from_slice(body).unwrap();
        (iob, sum)
    }

    #[test]
    fn router_advert_triggers_slaac() {
        let _guard = crate::TEST_MUTEX.lock();
        ipv6::clear_routes();
        neighbour::clear();
        let (_mock, dev) = MockDevice::create();
        dev.open().unwrap();

        let router: Ipv6Addr = "fe80::1".parse().unwrap();
        let our_ll = ipv6::link_local(&dev);

        // RA header (16 bytes) + prefix option (32 bytes)
        let mut body = [0u8; 48];
        body[0] = ICMP6_ROUTER_ADVERT;
        body[6..8].copy_from_slice(&1800u16.to_be_bytes()); // router lifetime
        body[16] = NDP_OPT_PREFIX;
        body[17] = 4; // 32 bytes
        body[18] = 64; // prefix length
        body[19] = 0xc0; // on-link + autonomous
        body[20..24].copy_from_slice(&86400u32.to_be_bytes()); // valid
        body[24..28].copy_from_slice(&14400u32.to_be_bytes()); // preferred
        let prefix: Ipv6Addr = "2001:db8:99::".parse().unwrap();
        body[32..48].copy_from_slice(&prefix.octets());

        let (iob, sum) = icmp6(router, our_ll, &mut body);
        icmp6_rx(iob, &dev, router, our_ll, sum).unwrap();

        let routes = ipv6::miniroutes();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].address.to_string().starts_with("2001:db8:99"));
        assert_eq!(routes[0].router, Some(router));

        ipv6::clear_routes();
        neighbour::clear();
        NetDevice::unregister(&dev);
    }

    #[test]
    fn neighbour_advert_updates_cache() {
        let _guard = crate::TEST_MUTEX.lock();
        neighbour::clear();
        let (_mock, dev) = MockDevice::create();
        dev.open().unwrap();

        let peer: Ipv6Addr = "fe80::2".parse().unwrap();
        // Create a pending entry first
        tx(IoBuffer::from_slice(b"pkt"), &dev, &peer.octets()).unwrap();

        let mut body = [0u8; 32];
        body[0] = ICMP6_NEIGHBOUR_ADVERT;
        body[4] = 0x60;
        body[8..24].copy_from_slice(&peer.octets());
        body[24] = NDP_OPT_TARGET_LL;
        body[25] = 1;
        body[26..32].copy_from_slice(&[0xcc; 6]);
        let our_ll = ipv6::link_local(&dev);
        let (iob, sum) = icmp6(peer, our_ll, &mut body);
        icmp6_rx(iob, &dev, peer, our_ll, sum).unwrap();

        assert_eq!(
            neighbour::lookup(&dev, ETH_P_IPV6, &peer.octets()),
            Some(MacAddr([0xcc; 6]))
        );

        neighbour::clear();
        NetDevice::unregister(&dev);
    }

    #[test]
    fn solicitation_goes_to_solicited_node_group() {
        let _guard = crate::TEST_MUTEX.lock();
        neighbour::clear();
        let (mock, dev) = MockDevice::create();
        dev.open().unwrap();

        let target: Ipv6Addr = "fe80::42".parse().unwrap();
        tx(IoBuffer::from_slice(b"pkt"), &dev, &target.octets()).unwrap();

        let frame = mock.pop_sent().unwrap();
        // 33:33 multicast MAC carrying the solicited-node group
        assert_eq!(&frame[0..2], &[0x33, 0x33]);
        // IPv6 destination inside the frame
        let dest = &frame[14 + 24..14 + 40];
        assert_eq!(dest[0], 0xff);
        assert_eq!(dest[1], 0x02);
        assert_eq!(dest[13], 0xff);

        neighbour::clear();
        NetDevice::unregister(&dev);
    }
}
