//! Transport-layer demultiplexing and the Internet checksum.

use alloc::vec::Vec;
use core::net::{IpAddr, SocketAddr};

use spin::RwLock;

use cinder_kernel::error::Result;
use cinder_kernel::iobuf::IoBuffer;

// IP protocol numbers
pub const IP_ICMP: u8 = 1;
pub const IP_TCP: u8 = 6;
pub const IP_UDP: u8 = 17;
pub const IP_ICMP6: u8 = 58;

/// A registered transport protocol
#[derive(Clone, Copy)]
pub struct TcpipProtocol {
    pub name: &'static str,
    /// IP protocol number
    pub proto: u8,
    /// Receive handler: payload buffer, source and destination socket
    /// addresses (port zero until the transport parses its own header),
    /// and the partial pseudo-header checksum
    pub rx: fn(iobuf: IoBuffer, src: SocketAddr, dest: SocketAddr, pshdr_sum: u32) -> Result<()>,
}

static PROTOCOLS: RwLock<Vec<TcpipProtocol>> = RwLock::new(Vec::new());

/// Register a transport protocol
pub fn register_tcpip_protocol(protocol: TcpipProtocol) {
    let mut protocols = PROTOCOLS.write();
    if protocols.iter().any(|p| p.proto == protocol.proto) {
        return;
    }
    protocols.push(protocol);
}

/// Dispatch a received network-layer payload to its transport
pub fn tcpip_rx(
    iobuf: IoBuffer,
    proto: u8,
    src: IpAddr,
    dest: IpAddr,
    pshdr_sum: u32,
) -> Result<()> {
    let protocols = PROTOCOLS.read().clone();
    for protocol in protocols {
        if protocol.proto == proto {
            return (protocol.rx)(
                iobuf,
                SocketAddr::new(src, 0),
                SocketAddr::new(dest, 0),
                pshdr_sum,
            );
        }
    }
    log::debug!("no transport for IP protocol {proto}");
    Ok(())
}

// ============================================================================
// RFC 1071 checksum
// ============================================================================

/// Continue a 16-bit one's-complement sum over `data`
pub fn checksum_partial(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

/// Fold a partial sum and complement it into the final checksum
pub fn checksum_final(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// One-shot checksum over a contiguous region
pub fn checksum(data: &[u8]) -> u16 {
    checksum_final(checksum_partial(0, data))
}

/// Partial sum over the IPv4/IPv6 pseudo-header
pub fn pshdr_sum(src: IpAddr, dest: IpAddr, proto: u8, len: usize) -> u32 {
    let mut sum = 0;
    match (src, dest) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum = checksum_partial(sum, &s.octets());
            sum = checksum_partial(sum, &d.octets());
            sum += u32::from(proto);
            sum += len as u32;
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            sum = checksum_partial(sum, &s.octets());
            sum = checksum_partial(sum, &d.octets());
            sum += len as u32;
            sum += u32::from(proto);
        }
        _ => {}
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_example() {
        // The classic worked example: 0x0001 0xf203 0xf4f5 0xf6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        assert_eq!(checksum(&[0x12]), !0x1200);
    }

    #[test]
    fn verifying_a_packet_including_its_checksum_yields_zero() {
        let mut header = [0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00,
                          0x40, 0x11, 0x00, 0x00, 10, 0, 2, 15, 10, 0, 2, 2];
        let csum = checksum(&header);
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }
}
