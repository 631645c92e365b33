//! ICMP (v4): echo replies and destination-unreachable reporting.

use core::net::{IpAddr, SocketAddr};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::iobuf::IoBuffer;

use crate::ipv4;
use crate::tcpip::{self, TcpipProtocol};

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;

fn rx(mut iobuf: IoBuffer, src: SocketAddr, dest: SocketAddr, _pshdr_sum: u32) -> Result<()> {
    let message = iobuf.as_ref();
    if message.len() < 8 {
        return Err(Error::Protocol);
    }
    // ICMPv4 checksum covers the message only, no pseudo-header
    if tcpip::checksum(message) != 0 {
        return Err(Error::Protocol);
    }

    match message[0] {
        ICMP_ECHO_REQUEST => {
            let (IpAddr::V4(src_v4), IpAddr::V4(dest_v4)) = (src.ip(), dest.ip()) else {
                return Err(Error::InvalidArgument);
            };
            let mut reply = IoBuffer::alloc(message.len());
            reply.extend_from_slice(message)?;
            let msg = reply.as_mut();
            msg[0] = ICMP_ECHO_REPLY;
            msg[2..4].copy_from_slice(&[0, 0]);
            let csum = tcpip::checksum(msg);
            msg[2..4].copy_from_slice(&csum.to_be_bytes());
            log::debug!("answering ping from {src_v4}");
            ipv4::tx(reply, tcpip::IP_ICMP, dest_v4, src_v4, None)
        }
        ICMP_DEST_UNREACHABLE => {
            log::debug!("destination unreachable (code {}) from {}", message[1], src.ip());
            iobuf.pull(8)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        tcpip::register_tcpip_protocol(TcpipProtocol {
            name: "ICMP",
            proto: tcpip::IP_ICMP,
            rx,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;

    #[test]
    fn echo_request_generates_reply() {
        let _guard = crate::TEST_MUTEX.lock();
        ipv4::clear_routes();
        let (mock, dev) = crate::netdev::MockDevice::create();
        dev.open().unwrap();
        ipv4::add_miniroute(&dev, Ipv4Addr::new(10, 0, 2, 15), Ipv4Addr::new(255, 255, 255, 0), None);
        // Pre-resolve the pinger so the reply transmits immediately
        crate::neighbour::clear();
        let _ = crate::arp::tx(IoBuffer::from_slice(b""), &dev, &[10, 0, 2, 2]);
        crate::neighbour::update(&dev, crate::ethernet::ETH_P_IP, &[10, 0, 2, 2],
                                 crate::netdev::MacAddr([0xee; 6]));
        while mock.pop_sent().is_some() {}

        let mut body = [0u8; 16];
        body[0] = ICMP_ECHO_REQUEST;
        body[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        let csum = tcpip::checksum(&body);
        body[2..4].copy_from_slice(&csum.to_be_bytes());

        let iob = IoBuffer::from_slice(&body);
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 2)), 0);
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)), 0);
        rx(iob, src, dest, 0).unwrap();

        let frame = mock.pop_sent().unwrap();
        // ICMP type byte inside IPv4 inside Ethernet
        assert_eq!(frame[14 + 20], ICMP_ECHO_REPLY);

        ipv4::clear_routes();
        crate::neighbour::clear();
        crate::netdev::NetDevice::unregister(&dev);
    }
}
