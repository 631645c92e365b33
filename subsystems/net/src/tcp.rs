//! # TCP
//!
//! A full RFC 793 state machine with the RFC 5681 loss-recovery
//! primitives a boot client needs: go-back-N retransmission with a
//! doubling RTO, bounded out-of-order reassembly, zero-window persist
//! probes, MSS and window-scale options on SYN, four-way close and RST
//! abort. Sequence arithmetic is modular throughout, so connections
//! carrying more than 2^32 bytes keep flowing.
//!
//! Applications see a data interface: delivered buffers queue for
//! transmission, received bytes flow upward in order through `deliver`,
//! and the application's `window` op propagates flow control into the
//! advertised receive window.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{IpAddr, SocketAddr};

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process::{self, Process};
use cinder_kernel::random;
use cinder_kernel::retry::RetryTimer;
use cinder_kernel::ticks::TICKS_PER_SEC;

use crate::ipv4;
use crate::ipv6;
use crate::tcpip::{self, TcpipProtocol};

/// TCP header length without options
pub const TCP_HLEN: usize = 20;

/// MSS advertised on our SYN
const TCP_MSS: u16 = 1460;

/// Transmit buffer bound per connection
const TX_BUFFER: usize = 16 * 1024;

/// Out-of-order reassembly bound per connection (bytes)
const OOO_BUFFER: usize = 64 * 1024;

/// Initial retransmission timeout (1 s), doubling to the cap
const RTO_MIN: u64 = TICKS_PER_SEC;
const RTO_MAX: u64 = 60 * TICKS_PER_SEC;

/// TIME_WAIT linger
const MSL_TIMEOUT: u64 = 2 * TICKS_PER_SEC;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Connection states (RFC 793 section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

/// `a < b` in sequence space
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

struct TcpState {
    st: State,
    /// Oldest unacknowledged sequence number
    snd_una: u32,
    /// Next sequence number to send
    snd_nxt: u32,
    /// Peer's advertised window, scaled
    snd_wnd: u32,
    /// Peer's window scale shift
    snd_scale: u8,
    /// Next sequence number expected from the peer
    rcv_nxt: u32,
    /// Outbound byte stream from `snd_una` (data only, no phantom bytes)
    tx: VecDeque<u8>,
    /// Application requested a graceful close
    tx_closed: bool,
    fin_sent: bool,
    fin_acked: bool,
    /// Sequence number our FIN occupies, once sent
    fin_seq: u32,
    /// Peer FIN seen (EOF delivered upward)
    peer_fin: bool,
    /// Out-of-order segments keyed by sequence number
    ooo: BTreeMap<u32, Vec<u8>>,
    /// Peer MSS
    mss: u16,
    rtx_timer: RetryTimer,
    persist_timer: RetryTimer,
    keepalive: Option<RetryTimer>,
    time_wait: RetryTimer,
}

/// A TCP connection
pub struct TcpConnection {
    local_port: u16,
    peer: SocketAddr,
    /// Application data interface
    pub intf: Intf,
    state: Mutex<TcpState>,
}

static CONNECTIONS: RwLock<Vec<Arc<TcpConnection>>> = RwLock::new(Vec::new());

impl TcpConnection {
    /// Actively open a connection to `peer`
    pub fn open(peer: SocketAddr, receiver: Arc<dyn XferTarget>) -> Result<Arc<TcpConnection>> {
        let local_port = loop {
            let candidate = random::ephemeral_port();
            if !CONNECTIONS.read().iter().any(|c| c.local_port == candidate) {
                break candidate;
            }
        };
        let iss = random::rand_u32();
        let conn = Arc::new(TcpConnection {
            local_port,
            peer,
            intf: Intf::new(),
            state: Mutex::new(TcpState {
                st: State::SynSent,
                snd_una: iss,
                snd_nxt: iss,
                snd_wnd: TCP_MSS as u32,
                snd_scale: 0,
                rcv_nxt: 0,
                tx: VecDeque::new(),
                tx_closed: false,
                fin_sent: false,
                fin_acked: false,
                fin_seq: 0,
                peer_fin: false,
                ooo: BTreeMap::new(),
                mss: TCP_MSS,
                rtx_timer: RetryTimer::new(RTO_MIN, RTO_MAX),
                persist_timer: RetryTimer::new(RTO_MIN, RTO_MAX),
                keepalive: None,
                time_wait: RetryTimer::new(MSL_TIMEOUT, MSL_TIMEOUT),
            }),
        });
        conn.intf.plug(receiver);
        CONNECTIONS.write().push(conn.clone());

        log::debug!("TCP {}:{} > {} SYN", local_port, iss, peer);
        {
            let mut state = conn.state.lock();
            if let Err(err) = conn.tx_segment(&mut state, iss, TcpFlags::SYN, &[]) {
                drop(state);
                conn.unregister();
                conn.intf.unplug();
                return Err(err);
            }
            state.snd_nxt = iss.wrapping_add(1);
            state.rtx_timer.start();
        }
        Ok(conn)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state_name(&self) -> State {
        self.state.lock().st
    }

    /// Enable keepalive probes (off by default)
    pub fn enable_keepalive(&self, interval: u64) {
        let mut state = self.state.lock();
        let mut timer = RetryTimer::new(interval, interval);
        timer.start();
        state.keepalive = Some(timer);
    }

    /// The receive window we advertise: the application's appetite,
    /// clamped to what fits an unscaled header field
    fn rcv_window(&self) -> u32 {
        let app = self.intf.window();
        (app.min(0xffff)) as u32
    }

    /// Build and transmit one segment
    fn tx_segment(
        &self,
        state: &mut TcpState,
        seq: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Result<()> {
        let with_syn_opts = flags.contains(TcpFlags::SYN);
        let opts_len = if with_syn_opts { 8 } else { 0 };
        let header_len = TCP_HLEN + opts_len;

        let mut iobuf = IoBuffer::alloc(header_len + payload.len());
        iobuf.reserve(header_len)?;
        iobuf.extend_from_slice(payload)?;

        let window = self.rcv_window() as u16;
        let header = iobuf.push(header_len)?;
        header[0..2].copy_from_slice(&self.local_port.to_be_bytes());
        header[2..4].copy_from_slice(&self.peer.port().to_be_bytes());
        header[4..8].copy_from_slice(&seq.to_be_bytes());
        header[8..12].copy_from_slice(&state.rcv_nxt.to_be_bytes());
        header[12] = ((header_len / 4) as u8) << 4;
        header[13] = flags.bits();
        header[14..16].copy_from_slice(&window.to_be_bytes());
        header[16..18].copy_from_slice(&[0, 0]);
        header[18..20].copy_from_slice(&[0, 0]);
        if with_syn_opts {
            // MSS + window scale (shift 0) + end-of-options padding
            header[20] = 2;
            header[21] = 4;
            header[22..24].copy_from_slice(&TCP_MSS.to_be_bytes());
            header[24] = 3;
            header[25] = 3;
            header[26] = 0;
            header[27] = 0;
        }

        let total = iobuf.len();
        let (src_ip, dest_ip) = match self.peer.ip() {
            IpAddr::V4(dest) => (IpAddr::V4(ipv4::source_for(dest, None)), IpAddr::V4(dest)),
            IpAddr::V6(dest) => (IpAddr::V6(ipv6::source_for(dest, None)), IpAddr::V6(dest)),
        };
        let sum = tcpip::pshdr_sum(src_ip, dest_ip, tcpip::IP_TCP, total);
        let csum = tcpip::checksum_final(tcpip::checksum_partial(sum, iobuf.as_ref()));
        iobuf.as_mut()[16..18].copy_from_slice(&csum.to_be_bytes());

        match (src_ip, dest_ip) {
            (IpAddr::V4(src), IpAddr::V4(dest)) => {
                ipv4::tx(iobuf, tcpip::IP_TCP, src, dest, None)
            }
            (IpAddr::V6(src), IpAddr::V6(dest)) => {
                ipv6::tx(iobuf, tcpip::IP_TCP, src, dest, None)
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Send a bare ACK
    fn tx_ack(&self, state: &mut TcpState) {
        let seq = state.snd_nxt;
        let _ = self.tx_segment(state, seq, TcpFlags::ACK, &[]);
    }

    /// Push pending data and a FIN when due
    fn tx_pending(&self, state: &mut TcpState) {
        if !matches!(
            state.st,
            State::Established | State::CloseWait | State::FinWait1 | State::LastAck
        ) {
            return;
        }

        loop {
            // Bytes already in flight (beyond any phantom FIN)
            let in_flight = state.snd_nxt.wrapping_sub(state.snd_una) as usize;
            if state.fin_sent {
                break;
            }
            let unsent = state.tx.len().saturating_sub(in_flight);
            let window_left = (state.snd_wnd as usize).saturating_sub(in_flight);
            let chunk = unsent.min(window_left).min(usize::from(state.mss));
            if chunk == 0 {
                break;
            }
            let payload: Vec<u8> = state
                .tx
                .iter()
                .skip(in_flight)
                .take(chunk)
                .copied()
                .collect();
            let seq = state.snd_nxt;
            let mut flags = TcpFlags::ACK;
            if unsent == chunk {
                flags |= TcpFlags::PSH;
            }
            if self.tx_segment(state, seq, flags, &payload).is_err() {
                break;
            }
            state.snd_nxt = state.snd_nxt.wrapping_add(chunk as u32);
            if !state.rtx_timer.running() {
                state.rtx_timer.start();
            }
        }

        // FIN once the stream is closed and drained
        let in_flight = state.snd_nxt.wrapping_sub(state.snd_una) as usize;
        if state.tx_closed && !state.fin_sent && in_flight == state.tx.len() {
            let seq = state.snd_nxt;
            if self
                .tx_segment(state, seq, TcpFlags::FIN | TcpFlags::ACK, &[])
                .is_ok()
            {
                state.fin_sent = true;
                state.fin_seq = seq;
                state.snd_nxt = seq.wrapping_add(1);
                state.st = match state.st {
                    State::Established => State::FinWait1,
                    State::CloseWait => State::LastAck,
                    other => other,
                };
                if !state.rtx_timer.running() {
                    state.rtx_timer.start();
                }
            }
        }
    }

    /// Retransmit everything from `snd_una` (go-back-N)
    fn retransmit(&self, state: &mut TcpState) {
        match state.st {
            State::SynSent | State::SynRcvd => {
                let seq = state.snd_una;
                let flags = if state.st == State::SynSent {
                    TcpFlags::SYN
                } else {
                    TcpFlags::SYN | TcpFlags::ACK
                };
                let _ = self.tx_segment(state, seq, flags, &[]);
            }
            _ => {
                state.snd_nxt = state.snd_una;
                if state.fin_sent {
                    state.fin_sent = false;
                }
                self.tx_pending(state);
            }
        }
        state.rtx_timer.start();
    }

    /// Close from above: graceful on `Ok`, RST abort on error
    fn app_close(&self, rc: Result<()>) {
        match rc {
            Ok(()) => {
                let mut state = self.state.lock();
                state.tx_closed = true;
                self.tx_pending(&mut state);
            }
            Err(_) => self.abort(),
        }
    }

    /// Send RST and drop straight to CLOSED
    pub fn abort(&self) {
        let mut state = self.state.lock();
        let seq = state.snd_nxt;
        let _ = self.tx_segment(&mut state, seq, TcpFlags::RST | TcpFlags::ACK, &[]);
        state.st = State::Closed;
        drop(state);
        self.unregister();
        self.intf.shutdown(Err(Error::Cancelled));
    }

    fn unregister(&self) {
        CONNECTIONS
            .write()
            .retain(|c| c.local_port != self.local_port);
    }

    /// Tear down with a reason, notifying the application
    fn destroy(&self, rc: Result<()>) {
        {
            let mut state = self.state.lock();
            state.st = State::Closed;
            state.rtx_timer.stop();
            state.persist_timer.stop();
        }
        self.unregister();
        self.intf.shutdown(rc);
    }

    /// Advance `rcv_nxt` over in-order data, draining the reassembly
    /// queue as gaps fill
    ///
    /// Returns the byte runs to hand upward. Delivery happens after the
    /// connection lock is released: the consumer may close the connection
    /// from inside its `deliver`.
    fn queue_in_order(state: &mut TcpState, seq: u32, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut deliveries = Vec::new();
        if !payload.is_empty() {
            if seq == state.rcv_nxt {
                state.rcv_nxt = state.rcv_nxt.wrapping_add(payload.len() as u32);
                deliveries.push(payload.to_vec());
            } else if seq_lt(state.rcv_nxt, seq) {
                // Out of order: stash, bounded
                let buffered: usize = state.ooo.values().map(Vec::len).sum();
                if buffered + payload.len() <= OOO_BUFFER {
                    state.ooo.entry(seq).or_insert_with(|| payload.to_vec());
                }
            }
            // Duplicate or overlapping-old data is dropped; the ACK below
            // resynchronises the peer
        }

        // Pull newly contiguous segments out of the reassembly queue
        loop {
            let Some((&seq, _)) = state.ooo.iter().next() else {
                break;
            };
            if seq_lt(state.rcv_nxt, seq) {
                break;
            }
            let Some(data) = state.ooo.remove(&seq) else {
                break;
            };
            let skip = state.rcv_nxt.wrapping_sub(seq) as usize;
            if skip < data.len() {
                let fresh = data[skip..].to_vec();
                state.rcv_nxt = state.rcv_nxt.wrapping_add(fresh.len() as u32);
                deliveries.push(fresh);
            }
        }
        deliveries
    }

    /// Process one inbound segment
    #[allow(clippy::too_many_arguments)]
    fn rx_segment(
        self: &Arc<Self>,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        options: &[u8],
        payload: &[u8],
    ) {
        let mut state = self.state.lock();

        // RST tears the connection down immediately
        if flags.contains(TcpFlags::RST) {
            let rc = if state.st == State::SynSent {
                Err(Error::ConnectionRefused)
            } else {
                Err(Error::ConnectionReset)
            };
            log::debug!("TCP {} reset by peer", self.local_port);
            drop(state);
            self.destroy(rc);
            return;
        }

        if state.st == State::SynSent {
            if !flags.contains(TcpFlags::SYN) || !flags.contains(TcpFlags::ACK) {
                return;
            }
            if ack != state.snd_nxt {
                return;
            }
            state.snd_una = ack;
            state.rcv_nxt = seq.wrapping_add(1);
            parse_syn_options(options, &mut state);
            state.snd_wnd = u32::from(window) << state.snd_scale;
            state.st = State::Established;
            state.rtx_timer.stop();
            log::debug!("TCP {} established", self.local_port);
            self.tx_ack(&mut state);
            self.tx_pending(&mut state);
            return;
        }

        // ACK processing
        if flags.contains(TcpFlags::ACK) {
            if seq_lt(state.snd_una, ack) && seq_le(ack, state.snd_nxt) {
                let mut advanced = ack.wrapping_sub(state.snd_una) as usize;
                // A FIN consumes one phantom sequence number
                if state.fin_sent && ack == state.fin_seq.wrapping_add(1) {
                    state.fin_acked = true;
                    advanced = advanced.saturating_sub(1);
                }
                if state.st == State::SynRcvd {
                    // Our SYN|ACK's phantom byte
                    advanced = advanced.saturating_sub(1);
                    state.st = State::Established;
                }
                for _ in 0..advanced.min(state.tx.len()) {
                    state.tx.pop_front();
                }
                state.snd_una = ack;
                state.rtx_timer.stop();
                if state.snd_una != state.snd_nxt {
                    state.rtx_timer.start();
                }
            }
            state.snd_wnd = u32::from(window) << state.snd_scale;

            if state.fin_acked {
                match state.st {
                    State::FinWait1 => {
                        state.st = State::FinWait2;
                    }
                    State::Closing => {
                        state.st = State::TimeWait;
                        state.time_wait.start();
                    }
                    State::LastAck => {
                        drop(state);
                        self.destroy(Ok(()));
                        return;
                    }
                    _ => {}
                }
            }
        }

        // In-window data
        let deliveries = Self::queue_in_order(&mut state, seq, payload);

        // FIN processing: must sit exactly at the edge of received data
        let mut eof = false;
        if flags.contains(TcpFlags::FIN) {
            let fin_seq = seq.wrapping_add(payload.len() as u32);
            if fin_seq == state.rcv_nxt && !state.peer_fin {
                state.peer_fin = true;
                eof = true;
                state.rcv_nxt = state.rcv_nxt.wrapping_add(1);
                state.st = match state.st {
                    State::Established => State::CloseWait,
                    State::FinWait1 => {
                        if state.fin_acked {
                            state.time_wait.start();
                            State::TimeWait
                        } else {
                            State::Closing
                        }
                    }
                    State::FinWait2 => {
                        state.time_wait.start();
                        State::TimeWait
                    }
                    other => other,
                };
            }
        }

        if !payload.is_empty() || eof {
            self.tx_ack(&mut state);
        }
        self.tx_pending(&mut state);
        drop(state);

        // Upward traffic happens with the connection unlocked: the
        // consumer may call straight back in (even to close us)
        for run in deliveries {
            let _ = self
                .intf
                .deliver(IoBuffer::from_slice(&run), &XferMeta::default());
        }
        if eof {
            // EOF upward: the stream completed cleanly
            self.intf.shutdown(Ok(()));
        }
    }

    /// Timer pass
    fn step(self: &Arc<Self>) {
        let mut state = self.state.lock();

        if state.st == State::TimeWait {
            if state.time_wait.expired().is_some() {
                drop(state);
                self.unregister();
            }
            return;
        }

        match state.rtx_timer.expired() {
            Some(true) => {
                log::debug!("TCP {} retransmission ceiling", self.local_port);
                drop(state);
                self.destroy(Err(Error::TimedOut));
                return;
            }
            Some(false) => {
                log::debug!("TCP {} retransmit", self.local_port);
                self.retransmit(&mut state);
            }
            None => {}
        }

        // Zero-window probe
        let blocked = state.snd_wnd == 0
            && !state.tx.is_empty()
            && matches!(state.st, State::Established | State::CloseWait);
        if blocked {
            if !state.persist_timer.running() {
                state.persist_timer.start();
            } else if state.persist_timer.expired() == Some(false) {
                // One-byte probe from the front of the stream
                let seq = state.snd_una;
                let probe: Vec<u8> = state.tx.iter().take(1).copied().collect();
                let _ = self.tx_segment(&mut state, seq, TcpFlags::ACK, &probe);
                state.persist_timer.start();
            }
        } else {
            state.persist_timer.stop();
        }

        // Optional keepalive
        let mut fire_keepalive = false;
        if let Some(keepalive) = state.keepalive.as_mut() {
            if keepalive.expired().is_some() {
                keepalive.start();
                fire_keepalive = true;
            }
        }
        if fire_keepalive && state.st == State::Established {
            let seq = state.snd_nxt.wrapping_sub(1);
            let _ = self.tx_segment(&mut state, seq, TcpFlags::ACK, &[]);
        }

        self.tx_pending(&mut state);
    }
}

impl XferTarget for TcpConnection {
    /// Queue application data for transmission
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(state.st, State::Closed | State::TimeWait | State::LastAck) {
            return Err(Error::Cancelled);
        }
        if state.tx.len() + iobuf.len() > TX_BUFFER {
            return Err(Error::NoBufs);
        }
        state.tx.extend(iobuf.as_ref());
        self.tx_pending(&mut state);
        Ok(())
    }

    /// Free space in the transmit buffer
    fn window(&self) -> usize {
        TX_BUFFER.saturating_sub(self.state.lock().tx.len())
    }

    fn close(&self, rc: Result<()>) {
        self.app_close(rc);
    }
}

impl core::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("local_port", &self.local_port)
            .field("peer", &self.peer)
            .field("state", &self.state.lock().st)
            .finish()
    }
}

fn parse_syn_options(mut options: &[u8], state: &mut TcpState) {
    while !options.is_empty() {
        match options[0] {
            0 => break,
            1 => {
                options = &options[1..];
            }
            kind => {
                let Some(&len) = options.get(1) else { break };
                let len = usize::from(len);
                if len < 2 || len > options.len() {
                    break;
                }
                match kind {
                    2 if len == 4 => {
                        state.mss = u16::from_be_bytes([options[2], options[3]]).min(TCP_MSS);
                    }
                    3 if len == 3 => {
                        state.snd_scale = options[2].min(14);
                    }
                    _ => {}
                }
                options = &options[len..];
            }
        }
    }
}

/// Receive handler registered with the transport demultiplexer
fn rx(mut iobuf: IoBuffer, src: SocketAddr, dest: SocketAddr, pshdr_sum: u32) -> Result<()> {
    let data = iobuf.as_ref();
    if data.len() < TCP_HLEN {
        return Err(Error::Protocol);
    }
    if tcpip::checksum_final(tcpip::checksum_partial(pshdr_sum, data)) != 0 {
        log::debug!("TCP bad checksum from {}", src.ip());
        return Err(Error::Protocol);
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dest_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let data_off = usize::from(data[12] >> 4) * 4;
    let flags = TcpFlags::from_bits_truncate(data[13]);
    let window = u16::from_be_bytes([data[14], data[15]]);
    if data_off < TCP_HLEN || data_off > data.len() {
        return Err(Error::Protocol);
    }
    let options = data[TCP_HLEN..data_off].to_vec();

    iobuf.pull(data_off)?;
    let payload = iobuf.as_ref().to_vec();

    let peer = SocketAddr::new(src.ip(), src_port);
    let conn = CONNECTIONS
        .read()
        .iter()
        .find(|c| c.local_port == dest_port && c.peer == peer)
        .cloned();

    match conn {
        Some(conn) => {
            conn.rx_segment(seq, ack, flags, window, &options, &payload);
            Ok(())
        }
        None => {
            log::debug!("TCP no connection for {dest_port} from {peer}");
            // A boot client owns no listeners: refuse politely unless the
            // stray segment is itself a reset
            if !flags.contains(TcpFlags::RST) {
                let _ = tx_rst(dest, dest_port, peer, seq, ack, flags, payload.len());
            }
            Ok(())
        }
    }
}

/// Transmit a RST answering a stray segment
fn tx_rst(
    local: SocketAddr,
    local_port: u16,
    peer: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload_len: usize,
) -> Result<()> {
    let (seq_out, ack_out, out_flags) = if flags.contains(TcpFlags::ACK) {
        (ack, 0, TcpFlags::RST)
    } else {
        let advance = payload_len as u32 + u32::from(flags.contains(TcpFlags::SYN));
        (0, seq.wrapping_add(advance), TcpFlags::RST | TcpFlags::ACK)
    };

    let mut iobuf = IoBuffer::alloc(TCP_HLEN);
    let header = iobuf.put(TCP_HLEN)?;
    header[0..2].copy_from_slice(&local_port.to_be_bytes());
    header[2..4].copy_from_slice(&peer.port().to_be_bytes());
    header[4..8].copy_from_slice(&seq_out.to_be_bytes());
    header[8..12].copy_from_slice(&ack_out.to_be_bytes());
    header[12] = ((TCP_HLEN / 4) as u8) << 4;
    header[13] = out_flags.bits();

    let sum = tcpip::pshdr_sum(local.ip(), peer.ip(), tcpip::IP_TCP, TCP_HLEN);
    let csum = tcpip::checksum_final(tcpip::checksum_partial(sum, iobuf.as_ref()));
    iobuf.as_mut()[16..18].copy_from_slice(&csum.to_be_bytes());

    match (local.ip(), peer.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dest)) => ipv4::tx(iobuf, tcpip::IP_TCP, src, dest, None),
        (IpAddr::V6(src), IpAddr::V6(dest)) => ipv6::tx(iobuf, tcpip::IP_TCP, src, dest, None),
        _ => Err(Error::InvalidArgument),
    }
}

struct TcpProcess;

impl Process for TcpProcess {
    fn name(&self) -> &str {
        "tcp"
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
        tcpip::register_tcpip_protocol(TcpipProtocol {
            name: "TCP",
            proto: tcpip::IP_TCP,
            rx,
        });
        process::register_process(Arc::new(TcpProcess));
    });
}
