//! # UDP
//!
//! Connectionless transport. A connection object pins a local port,
//! optionally a bound peer, and an application data interface; received
//! datagrams demultiplex on destination port and travel upward with their
//! source address in the delivery metadata.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{IpAddr, SocketAddr};

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::random;

use crate::ipv4;
use crate::ipv6;
use crate::netdev::NetDevice;
use crate::tcpip::{self, TcpipProtocol};

/// UDP header length
pub const UDP_HLEN: usize = 8;

/// A UDP connection
pub struct UdpConnection {
    local_port: u16,
    peer: Mutex<Option<SocketAddr>>,
    /// Device pin for broadcast transmissions (DHCP)
    dev_hint: Mutex<Option<Arc<NetDevice>>>,
    /// Application data interface
    pub intf: Intf,
}

static CONNECTIONS: RwLock<Vec<Arc<UdpConnection>>> = RwLock::new(Vec::new());

impl UdpConnection {
    /// Open a connection
    ///
    /// `local_port` of `None` allocates an ephemeral port. The receiver is
    /// plugged as the application interface; the returned connection is
    /// itself an [`XferTarget`] accepting datagrams to transmit.
    pub fn open(
        peer: Option<SocketAddr>,
        local_port: Option<u16>,
        receiver: Arc<dyn XferTarget>,
    ) -> Result<Arc<UdpConnection>> {
        let port = match local_port {
            Some(port) => {
                if CONNECTIONS.read().iter().any(|c| c.local_port == port) {
                    return Err(Error::AddrInUse);
                }
                port
            }
            None => loop {
                let candidate = random::ephemeral_port();
                if !CONNECTIONS.read().iter().any(|c| c.local_port == candidate) {
                    break candidate;
                }
            },
        };
        let conn = Arc::new(UdpConnection {
            local_port: port,
            peer: Mutex::new(peer),
            dev_hint: Mutex::new(None),
            intf: Intf::new(),
        });
        conn.intf.plug(receiver);
        CONNECTIONS.write().push(conn.clone());
        log::debug!("UDP port {port} opened");
        Ok(conn)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Pin broadcast transmissions to a device
    pub fn set_dev_hint(&self, dev: Arc<NetDevice>) {
        *self.dev_hint.lock() = Some(dev);
    }

    /// Rebind the peer address
    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock() = Some(peer);
    }

    /// Close: unregister and shut down the application interface
    pub fn close(self: &Arc<Self>, rc: Result<()>) {
        CONNECTIONS.write().retain(|c| !Arc::ptr_eq(c, self));
        self.intf.shutdown(rc);
    }

    /// Transmit one datagram to `dest`
    pub fn tx(&self, mut iobuf: IoBuffer, dest: SocketAddr) -> Result<()> {
        let dev_hint = self.dev_hint.lock().clone();
        let payload_plus_header = iobuf.len() + UDP_HLEN;

        let (src_ip, dest_ip) = match dest.ip() {
            IpAddr::V4(dest_v4) => {
                let src = ipv4::source_for(dest_v4, dev_hint.as_ref());
                (IpAddr::V4(src), IpAddr::V4(dest_v4))
            }
            IpAddr::V6(dest_v6) => {
                let src = ipv6::source_for(dest_v6, dev_hint.as_ref());
                (IpAddr::V6(src), IpAddr::V6(dest_v6))
            }
        };

        let header = iobuf.push(UDP_HLEN)?;
        header[0..2].copy_from_slice(&self.local_port.to_be_bytes());
        header[2..4].copy_from_slice(&dest.port().to_be_bytes());
        header[4..6].copy_from_slice(&(payload_plus_header as u16).to_be_bytes());
        header[6..8].copy_from_slice(&[0, 0]);

        // Checksum over pseudo-header + datagram; always emitted, with the
        // zero value transmitted as all-ones
        let sum = tcpip::pshdr_sum(src_ip, dest_ip, tcpip::IP_UDP, payload_plus_header);
        let csum = tcpip::checksum_final(tcpip::checksum_partial(sum, iobuf.as_ref()));
        let csum = if csum == 0 { 0xffff } else { csum };
        iobuf.as_mut()[6..8].copy_from_slice(&csum.to_be_bytes());

        match (src_ip, dest_ip) {
            (IpAddr::V4(src), IpAddr::V4(dest_v4)) => {
                ipv4::tx(iobuf, tcpip::IP_UDP, src, dest_v4, dev_hint.as_ref())
            }
            (IpAddr::V6(src), IpAddr::V6(dest_v6)) => {
                ipv6::tx(iobuf, tcpip::IP_UDP, src, dest_v6, dev_hint.as_ref())
            }
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl XferTarget for UdpConnection {
    /// Deliver-to-transmit: metadata may override the bound peer
    fn deliver(&self, iobuf: IoBuffer, meta: &XferMeta) -> Result<()> {
        let dest = meta
            .dest
            .or(*self.peer.lock())
            .ok_or(Error::AddrNotAvailable)?;
        self.tx(iobuf, dest)
    }

    fn close(&self, _rc: Result<()>) {
        CONNECTIONS.write().retain(|c| c.local_port != self.local_port);
    }
}

impl core::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UdpConnection")
            .field("local_port", &self.local_port)
            .finish()
    }
}

/// Receive handler registered with the transport demultiplexer
fn rx(mut iobuf: IoBuffer, src: SocketAddr, dest: SocketAddr, pshdr_sum: u32) -> Result<()> {
    let data = iobuf.as_ref();
    if data.len() < UDP_HLEN {
        return Err(Error::Protocol);
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dest_port = u16::from_be_bytes([data[2], data[3]]);
    let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
    let csum = u16::from_be_bytes([data[6], data[7]]);
    if length < UDP_HLEN || length > data.len() {
        return Err(Error::Protocol);
    }

    // IPv4 permits an absent (zero) checksum; IPv6 does not
    if csum != 0 {
        if tcpip::checksum_final(tcpip::checksum_partial(pshdr_sum, &data[..length])) != 0 {
            log::debug!("UDP bad checksum from {src}");
            return Err(Error::Protocol);
        }
    } else if src.is_ipv6() {
        return Err(Error::Protocol);
    }

    let trim = iobuf.len() - length;
    if trim > 0 {
        iobuf.unput(trim)?;
    }
    iobuf.pull(UDP_HLEN)?;

    let conn = CONNECTIONS
        .read()
        .iter()
        .find(|c| c.local_port == dest_port)
        .cloned();
    let Some(conn) = conn else {
        log::debug!("UDP no listener on port {dest_port}");
        return Ok(());
    };

    let meta = XferMeta {
        offset: None,
        src: Some(SocketAddr::new(src.ip(), src_port)),
        dest: Some(SocketAddr::new(dest.ip(), dest_port)),
    };
    conn.intf.deliver(iobuf, &meta)
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        tcpip::register_tcpip_protocol(TcpipProtocol {
            name: "UDP",
            proto: tcpip::IP_UDP,
            rx,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        delivered: Mutex<Vec<(Vec<u8>, Option<SocketAddr>)>>,
        closes: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            })
        }
    }

    impl XferTarget for Recorder {
        fn deliver(&self, iobuf: IoBuffer, meta: &XferMeta) -> Result<()> {
            self.delivered
                .lock()
                .push((iobuf.as_ref().to_vec(), meta.src));
            Ok(())
        }

        fn close(&self, _rc: Result<()>) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn demux_on_destination_port() {
        let _guard = crate::TEST_MUTEX.lock();
        let recorder = Recorder::new();
        let conn = UdpConnection::open(None, Some(6800), recorder.clone()).unwrap();

        // src-port dest-port length csum + payload, checksum absent (v4)
        let mut wire = alloc::vec![0u8; UDP_HLEN];
        wire[0..2].copy_from_slice(&5353u16.to_be_bytes());
        wire[2..4].copy_from_slice(&6800u16.to_be_bytes());
        wire[4..6].copy_from_slice(&13u16.to_be_bytes());
        wire.extend_from_slice(b"hello");

        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 3)), 0);
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)), 0);
        rx(IoBuffer::from_slice(&wire), src, dest, 0).unwrap();

        let delivered = recorder.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, b"hello");
        assert_eq!(delivered[0].1.map(|s| s.port()), Some(5353));
        drop(delivered);

        conn.close(Ok(()));
        assert_eq!(recorder.closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn bad_checksum_dropped() {
        let _guard = crate::TEST_MUTEX.lock();
        let recorder = Recorder::new();
        let conn = UdpConnection::open(None, Some(6801), recorder.clone()).unwrap();

        let mut wire = alloc::vec![0u8; UDP_HLEN];
        wire[2..4].copy_from_slice(&6801u16.to_be_bytes());
        wire[4..6].copy_from_slice(&9u16.to_be_bytes());
        wire[6..8].copy_from_slice(&0xdeadu16.to_be_bytes());
        wire.push(b'x');

        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 3)), 0);
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)), 0);
        assert!(rx(IoBuffer::from_slice(&wire), src, dest, 0).is_err());
        assert!(recorder.delivered.lock().is_empty());
        conn.close(Ok(()));
    }

    #[test]
    fn duplicate_port_refused() {
        let _guard = crate::TEST_MUTEX.lock();
        let a = UdpConnection::open(None, Some(6802), Recorder::new()).unwrap();
        assert_eq!(
            UdpConnection::open(None, Some(6802), Recorder::new()).err(),
            Some(Error::AddrInUse)
        );
        a.close(Ok(()));
    }

    #[test]
    fn tx_builds_header_and_checksum() {
        let _guard = crate::TEST_MUTEX.lock();
        ipv4::clear_routes();
        let (mock, dev) = crate::netdev::MockDevice::create();
        dev.open().unwrap();

        let conn = UdpConnection::open(None, Some(6803), Recorder::new()).unwrap();
        conn.set_dev_hint(dev.clone());

        let mut iob = IoBuffer::alloc(4);
        iob.extend_from_slice(b"data").unwrap();
        conn.tx(
            iob,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 67),
        )
        .unwrap();

        let frame = mock.pop_sent().unwrap();
        let udp = &frame[14 + 20..];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 6803);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 67);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]), 12);
        // Verify the transmitted checksum over the pseudo-header
        let sum = tcpip::pshdr_sum(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::BROADCAST),
            tcpip::IP_UDP,
            12,
        );
        assert_eq!(
            tcpip::checksum_final(tcpip::checksum_partial(sum, &udp[..12])),
            0
        );

        conn.close(Ok(()));
        crate::netdev::NetDevice::unregister(&dev);
    }
}
