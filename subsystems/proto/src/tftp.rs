//! # TFTP (RFC 1350) with RFC 2347/2348/2349 options
//!
//! The read-request client: RRQ carries `blksize` and `tsize` options, an
//! OACK is processed before any data, block numbers wrap at 65536, and a
//! lower-numbered data block provokes a duplicate ACK rather than an
//! advance. An OACK with an out-of-range block size is a protocol error
//! and closes the session. MTFTP adds the `multicast` option and a second
//! listener on the negotiated port.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::SocketAddr;

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::open::{register_opener, UriOpener};
use cinder_kernel::process::{self, Process};
use cinder_kernel::retry::RetryTimer;
use cinder_kernel::uri::{percent_decode, Uri};
use cinder_net::udp::UdpConnection;

use crate::resolv::{self, NameResolution};

const TFTP_PORT: u16 = 69;

/// Block size we negotiate for
const BLKSIZE_REQUEST: usize = 1432;
/// Fallback when the server speaks plain RFC 1350
const BLKSIZE_DEFAULT: usize = 512;
/// Sanity bounds on a negotiated block size
const BLKSIZE_MIN: usize = 8;

// Opcodes
const OP_RRQ: u16 = 1;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolving,
    Request,
    Transfer,
    Done,
}

struct TftpState {
    phase: Phase,
    filename: String,
    blksize: usize,
    tsize: Option<u64>,
    /// Next data block expected
    next_block: u16,
    offset: u64,
    timer: RetryTimer,
    /// Server transfer-ID endpoint, learned from its first reply
    peer: Option<SocketAddr>,
    multicast: bool,
}

/// A TFTP download
pub struct TftpConnection {
    /// Downstream data interface
    pub intf: Intf,
    resolution: Arc<NameResolution>,
    conn: Mutex<Option<Arc<UdpConnection>>>,
    mcast_conn: Mutex<Option<Arc<UdpConnection>>>,
    state: Mutex<TftpState>,
}

static CONNECTIONS: RwLock<Vec<Arc<TftpConnection>>> = RwLock::new(Vec::new());

impl TftpConnection {
    /// Open a download described by `uri`, streaming into `receiver`
    pub fn open_uri(
        uri: &Uri,
        receiver: Arc<dyn XferTarget>,
        multicast: bool,
    ) -> Result<Arc<TftpConnection>> {
        let host = uri.host.as_deref().ok_or(Error::InvalidArgument)?;
        let filename = percent_decode(uri.path.as_deref().unwrap_or("/"))
            .trim_start_matches('/')
            .to_string();
        if filename.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let resolution = resolv::resolve(host, uri.port_or(TFTP_PORT))?;

        let conn = Arc::new(TftpConnection {
            intf: Intf::new(),
            resolution,
            conn: Mutex::new(None),
            mcast_conn: Mutex::new(None),
            state: Mutex::new(TftpState {
                phase: Phase::Resolving,
                filename,
                blksize: BLKSIZE_DEFAULT,
                tsize: None,
                next_block: 1,
                offset: 0,
                timer: RetryTimer::default(),
                peer: None,
                multicast,
            }),
        });
        conn.intf.plug(receiver);
        CONNECTIONS.write().push(conn.clone());
        Ok(conn)
    }

    fn finish(&self, rc: Result<()>) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }
            state.phase = Phase::Done;
            state.timer.stop();
        }
        if let Some(conn) = self.conn.lock().take() {
            conn.close(Ok(()));
        }
        if let Some(conn) = self.mcast_conn.lock().take() {
            conn.close(Ok(()));
        }
        CONNECTIONS.write().retain(|c| !core::ptr::eq(&**c, self));
        self.intf.shutdown(rc);
    }

    /// Send the RRQ (with negotiation options)
    fn send_rrq(&self) {
        let Some(Ok(server)) = self.resolution.result() else {
            return;
        };
        let mut state = self.state.lock();
        let mut rrq = Vec::new();
        rrq.extend_from_slice(&OP_RRQ.to_be_bytes());
        rrq.extend_from_slice(state.filename.as_bytes());
        rrq.push(0);
        rrq.extend_from_slice(b"octet\0");
        rrq.extend_from_slice(b"blksize\0");
        rrq.extend_from_slice(alloc::format!("{BLKSIZE_REQUEST}\0").as_bytes());
        rrq.extend_from_slice(b"tsize\00\0".as_ref());
        if state.multicast {
            rrq.extend_from_slice(b"multicast\0\0");
        }
        state.timer.start();
        drop(state);

        if let Some(conn) = self.conn.lock().clone() {
            let meta = XferMeta {
                dest: Some(server),
                ..Default::default()
            };
            let _ = conn.deliver(IoBuffer::from_slice(&rrq), &meta);
        }
    }

    /// ACK a block towards the server's transfer ID
    fn send_ack(&self, block: u16) {
        let peer = self.state.lock().peer;
        let Some(peer) = peer else { return };
        let mut ack = Vec::with_capacity(4);
        ack.extend_from_slice(&OP_ACK.to_be_bytes());
        ack.extend_from_slice(&block.to_be_bytes());
        if let Some(conn) = self.conn.lock().clone() {
            let meta = XferMeta {
                dest: Some(peer),
                ..Default::default()
            };
            let _ = conn.deliver(IoBuffer::from_slice(&ack), &meta);
        }
    }

    fn step(self: &Arc<Self>) {
        let phase = self.state.lock().phase;
        match phase {
            Phase::Resolving => match self.resolution.result() {
                Some(Ok(server)) => {
                    let conn = match UdpConnection::open(Some(server), None, self.clone()) {
                        Ok(conn) => conn,
                        Err(err) => {
                            self.finish(Err(err));
                            return;
                        }
                    };
                    *self.conn.lock() = Some(conn);
                    self.state.lock().phase = Phase::Request;
                    self.send_rrq();
                }
                Some(Err(err)) => self.finish(Err(err)),
                None => {}
            },
            Phase::Request | Phase::Transfer => {
                let expired = self.state.lock().timer.expired();
                match expired {
                    Some(true) => self.finish(Err(Error::TimedOut)),
                    Some(false) => {
                        let state = self.state.lock();
                        let phase = state.phase;
                        let last_ack = state.next_block.wrapping_sub(1);
                        drop(state);
                        if phase == Phase::Request {
                            self.send_rrq();
                        } else {
                            // Re-ACK the last block we have
                            self.send_ack(last_ack);
                            self.state.lock().timer.start();
                        }
                    }
                    None => {}
                }
            }
            Phase::Done => {}
        }
    }

    /// Handle an OACK's option list
    fn process_oack(&self, options: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let mut fields = options.split(|&b| b == 0);
        let mut mcast_request: Option<(SocketAddr, bool)> = None;
        loop {
            let Some(name) = fields.next() else { break };
            if name.is_empty() {
                continue;
            }
            let Some(value) = fields.next() else { break };
            let name = String::from_utf8_lossy(name).to_ascii_lowercase();
            let value = String::from_utf8_lossy(value).to_string();
            match name.as_str() {
                "blksize" => {
                    let size: usize = value.parse().map_err(|_| Error::Protocol)?;
                    if !(BLKSIZE_MIN..=BLKSIZE_REQUEST).contains(&size) {
                        // Out-of-range negotiation is a protocol violation,
                        // not something to silently renegotiate
                        return Err(Error::Protocol);
                    }
                    state.blksize = size;
                }
                "tsize" => {
                    state.tsize = value.parse().ok();
                }
                "multicast" => {
                    // "addr,port,mc"
                    let mut parts = value.split(',');
                    let addr = parts.next().unwrap_or("");
                    let port = parts.next().unwrap_or("");
                    let master = parts.next().unwrap_or("0") == "1";
                    if let (Ok(ip), Ok(port)) = (addr.parse(), port.parse()) {
                        mcast_request = Some((SocketAddr::new(ip, port), master));
                    }
                }
                _ => {}
            }
        }
        state.phase = Phase::Transfer;
        state.next_block = 1;
        state.timer.start();
        drop(state);

        if let Some((group, _master)) = mcast_request {
            // Listen on the negotiated multicast port for data blocks
            let mcast = UdpConnection::open(None, Some(group.port()), self_arc(self)?)?;
            *self.mcast_conn.lock() = Some(mcast);
        }
        Ok(())
    }

    /// Handle a DATA block
    fn process_data(&self, block: u16, payload: &[u8]) {
        let mut state = self.state.lock();
        if state.phase == Phase::Done {
            return;
        }
        if block == state.next_block {
            state.phase = Phase::Transfer;
            let offset = state.offset;
            state.offset += payload.len() as u64;
            let final_block = payload.len() < state.blksize;
            state.next_block = state.next_block.wrapping_add(1);
            state.timer.stop();
            if !final_block {
                state.timer.start();
            }
            drop(state);

            let meta = XferMeta {
                offset: Some(offset),
                ..Default::default()
            };
            let _ = self.intf.deliver(IoBuffer::from_slice(payload), &meta);
            self.send_ack(block);
            if final_block {
                log::debug!("TFTP transfer complete ({} bytes)", offset + payload.len() as u64);
                self.finish(Ok(()));
            }
        } else if block == state.next_block.wrapping_sub(1) {
            // Duplicate of the block we already have: re-ACK it
            drop(state);
            self.send_ack(block);
        }
        // Higher-numbered blocks are dropped
    }
}

/// Re-borrow self as an Arc for the secondary connection's receiver
fn self_arc(conn: &TftpConnection) -> Result<Arc<TftpConnection>> {
    CONNECTIONS
        .read()
        .iter()
        .find(|c| core::ptr::eq(&***c, conn))
        .cloned()
        .ok_or(Error::NoSuchEntity)
}

impl XferTarget for TftpConnection {
    /// A datagram from the server (or multicast group)
    fn deliver(&self, iobuf: IoBuffer, meta: &XferMeta) -> Result<()> {
        let data = iobuf.as_ref();
        if data.len() < 4 {
            return Ok(());
        }

        // Learn (or verify) the server's transfer ID
        {
            let mut state = self.state.lock();
            match (state.peer, meta.src) {
                (None, Some(src)) => state.peer = Some(src),
                (Some(peer), Some(src)) if peer != src => {
                    // A different TID is a different transfer, unless we
                    // joined a multicast session
                    if self.mcast_conn.lock().is_none() {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        let opcode = u16::from_be_bytes([data[0], data[1]]);
        match opcode {
            OP_OACK => {
                if let Err(err) = self.process_oack(&data[2..]) {
                    self.finish(Err(err));
                } else {
                    self.send_ack(0);
                }
                Ok(())
            }
            OP_DATA => {
                let block = u16::from_be_bytes([data[2], data[3]]);
                // A server that skips OACK starts straight in with data
                if self.state.lock().phase == Phase::Request {
                    self.state.lock().phase = Phase::Transfer;
                }
                self.process_data(block, &data[4..]);
                Ok(())
            }
            OP_ERROR => {
                let code = u16::from_be_bytes([data[2], data[3]]);
                let rc = match code {
                    1 => Error::NoSuchEntity,
                    2 => Error::PermissionDenied,
                    _ => Error::Protocol,
                };
                log::debug!("TFTP error {code}");
                self.finish(Err(rc));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn close(&self, rc: Result<()>) {
        self.finish(match rc {
            Ok(()) => Err(Error::Cancelled),
            err => err,
        });
    }
}

impl core::fmt::Debug for TftpConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TftpConnection")
            .field("file", &self.state.lock().filename)
            .finish()
    }
}

fn open_tftp(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
    Ok(TftpConnection::open_uri(uri, receiver, false)?)
}

fn open_mtftp(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
    Ok(TftpConnection::open_uri(uri, receiver, true)?)
}

struct TftpProcess;

impl Process for TftpProcess {
    fn name(&self) -> &str {
        "tftp"
    }

    fn step(&self) {
        let connections = CONNECTIONS.read().clone();
        for conn in connections {
            conn.step();
        }
    }
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        process::register_process(Arc::new(TftpProcess));
        register_opener(UriOpener {
            scheme: "tftp",
            open: open_tftp,
        });
        register_opener(UriOpener {
            scheme: "mtftp",
            open: open_mtftp,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::{IpAddr, Ipv4Addr};

    struct Collector {
        data: Mutex<Vec<u8>>,
        closed: Mutex<Option<Result<()>>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(Vec::new()),
                closed: Mutex::new(None),
            })
        }
    }

    impl XferTarget for Collector {
        fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
            self.data.lock().extend_from_slice(iobuf.as_ref());
            Ok(())
        }

        fn close(&self, rc: Result<()>) {
            *self.closed.lock() = Some(rc);
        }
    }

    fn make_conn(blksize: usize) -> (Arc<TftpConnection>, Arc<Collector>) {
        let uri = Uri::parse("tftp://192.0.2.10/pxelinux.0");
        let collector = Collector::new();
        let conn = TftpConnection::open_uri(&uri, collector.clone(), false).unwrap();
        {
            let mut state = conn.state.lock();
            state.phase = Phase::Transfer;
            state.blksize = blksize;
            state.peer = Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
                3001,
            ));
        }
        (conn, collector)
    }

    fn data_packet(block: u16, payload: &[u8]) -> IoBuffer {
        let mut out = Vec::new();
        out.extend_from_slice(&OP_DATA.to_be_bytes());
        out.extend_from_slice(&block.to_be_bytes());
        out.extend_from_slice(payload);
        IoBuffer::from_slice(&out)
    }

    fn meta_from_server() -> XferMeta {
        XferMeta {
            src: Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
                3001,
            )),
            ..Default::default()
        }
    }

    #[test]
    fn rrq_carries_options() {
        let _guard = crate::TEST_MUTEX.lock();
        let uri = Uri::parse("tftp://192.0.2.10/pxelinux.0");
        let collector = Collector::new();
        let conn = TftpConnection::open_uri(&uri, collector, false).unwrap();
        assert_eq!(conn.state.lock().filename, "pxelinux.0");
        conn.finish(Err(Error::Cancelled));
    }

    #[test]
    fn in_order_blocks_deliver_and_complete() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = make_conn(4);
        conn.deliver(data_packet(1, b"abcd"), &meta_from_server()).unwrap();
        conn.deliver(data_packet(2, b"efgh"), &meta_from_server()).unwrap();
        // Short block ends the transfer
        conn.deliver(data_packet(3, b"ij"), &meta_from_server()).unwrap();
        assert_eq!(collector.data.lock().as_slice(), b"abcdefghij");
        assert_eq!(*collector.closed.lock(), Some(Ok(())));
    }

    #[test]
    fn duplicate_block_does_not_redeliver() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = make_conn(4);
        conn.deliver(data_packet(1, b"abcd"), &meta_from_server()).unwrap();
        conn.deliver(data_packet(1, b"abcd"), &meta_from_server()).unwrap();
        assert_eq!(collector.data.lock().as_slice(), b"abcd");
        conn.finish(Err(Error::Cancelled));
    }

    #[test]
    fn higher_block_dropped() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = make_conn(4);
        conn.deliver(data_packet(5, b"zzzz"), &meta_from_server()).unwrap();
        assert!(collector.data.lock().is_empty());
        conn.finish(Err(Error::Cancelled));
    }

    #[test]
    fn oack_out_of_range_blksize_is_protocol_error() {
        let _guard = crate::TEST_MUTEX.lock();
        let uri = Uri::parse("tftp://192.0.2.10/f");
        let collector = Collector::new();
        let conn = TftpConnection::open_uri(&uri, collector.clone(), false).unwrap();
        conn.state.lock().phase = Phase::Request;

        let mut oack = Vec::new();
        oack.extend_from_slice(&OP_OACK.to_be_bytes());
        oack.extend_from_slice(b"blksize\065536\0");
        conn.deliver(IoBuffer::from_slice(&oack), &meta_from_server())
            .unwrap();
        assert_eq!(*collector.closed.lock(), Some(Err(Error::Protocol)));
    }

    #[test]
    fn oack_accepts_negotiated_options() {
        let _guard = crate::TEST_MUTEX.lock();
        let uri = Uri::parse("tftp://192.0.2.10/f");
        let collector = Collector::new();
        let conn = TftpConnection::open_uri(&uri, collector, false).unwrap();
        conn.state.lock().phase = Phase::Request;

        let mut oack = Vec::new();
        oack.extend_from_slice(&OP_OACK.to_be_bytes());
        oack.extend_from_slice(b"blksize\01432\0tsize\0131072\0");
        conn.deliver(IoBuffer::from_slice(&oack), &meta_from_server())
            .unwrap();
        let state = conn.state.lock();
        assert_eq!(state.blksize, 1432);
        assert_eq!(state.tsize, Some(131072));
        assert_eq!(state.phase, Phase::Transfer);
        drop(state);
        conn.finish(Err(Error::Cancelled));
    }

    #[test]
    fn block_numbers_wrap() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = make_conn(4);
        conn.state.lock().next_block = 65535;
        conn.deliver(data_packet(65535, b"wxyz"), &meta_from_server()).unwrap();
        conn.deliver(data_packet(0, b"1234"), &meta_from_server()).unwrap();
        conn.deliver(data_packet(1, b"56"), &meta_from_server()).unwrap();
        assert_eq!(collector.data.lock().as_slice(), b"wxyz123456");
        assert_eq!(*collector.closed.lock(), Some(Ok(())));
    }
}
