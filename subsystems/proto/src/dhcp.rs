//! # DHCPv4 Client (RFC 2131)
//!
//! The standard DISCOVER/OFFER/REQUEST/ACK four-step with PXE extras:
//! after the first real offer the client lingers up to one second for
//! ProxyDHCP offers (boot parameters from a second server that assigns no
//! address) and keeps their options in a secondary settings block. On ACK
//! every option lands in the NIC's settings block and the interface is
//! configured from the lease.
//!
//! Retransmission backs off from one second to sixty-four; the whole
//! exchange runs under a single deadline.

use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, SocketAddr};

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::job::MonoJob;
use cinder_kernel::process::{self, Process};
use cinder_kernel::random;
use cinder_kernel::retry::RetryTimer;
use cinder_kernel::ticks::{currticks, TICKS_PER_SEC};
use cinder_net::ipv4;
use cinder_net::netdev::NetDevice;
use cinder_net::udp::UdpConnection;
use cinder_settings::{register_settings, DhcpOptions, SettingsBlock, Tag, tag};

pub const DHCP_CLIENT_PORT: u16 = 68;
pub const DHCP_SERVER_PORT: u16 = 67;

const DHCP_MAGIC: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const BOOTP_HLEN: usize = 236;

// Message types
const DHCPDISCOVER: u8 = 1;
const DHCPOFFER: u8 = 2;
const DHCPREQUEST: u8 = 3;
const DHCPACK: u8 = 5;
const DHCPNAK: u8 = 6;

/// Retransmission bounds
const RETRY_MIN: u64 = TICKS_PER_SEC;
const RETRY_MAX: u64 = 64 * TICKS_PER_SEC;

/// Overall deadline with no usable response
const DEADLINE: u64 = 60 * TICKS_PER_SEC;

/// ProxyDHCP linger after the first address offer
const PROXY_WAIT: u64 = TICKS_PER_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Discover,
    ProxyWait,
    Request,
    Done,
}

struct Offer {
    yiaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
    server_id: Ipv4Addr,
    options: DhcpOptions,
}

struct SessionState {
    phase: Phase,
    xid: u32,
    start: u64,
    timer: RetryTimer,
    proxy_timer: RetryTimer,
    offer: Option<Offer>,
    proxy: Option<DhcpOptions>,
}

/// An in-flight DHCP exchange on one device
pub struct DhcpSession {
    dev: Arc<NetDevice>,
    /// Completion (job) interface
    pub job: Intf,
    conn: Mutex<Option<Arc<UdpConnection>>>,
    state: Mutex<SessionState>,
}

static SESSIONS: RwLock<Vec<Arc<DhcpSession>>> = RwLock::new(Vec::new());

impl DhcpSession {
    /// Begin a DHCP exchange; completion is reported on `job_receiver`
    pub fn start(
        dev: &Arc<NetDevice>,
        job_receiver: Arc<dyn XferTarget>,
    ) -> Result<Arc<DhcpSession>> {
        let session = Arc::new(DhcpSession {
            dev: dev.clone(),
            job: Intf::new(),
            conn: Mutex::new(None),
            state: Mutex::new(SessionState {
                phase: Phase::Discover,
                xid: random::rand_u32(),
                start: currticks(),
                timer: RetryTimer::new(RETRY_MIN, RETRY_MAX),
                proxy_timer: RetryTimer::new(PROXY_WAIT, PROXY_WAIT),
                offer: None,
                proxy: None,
            }),
        });
        session.job.plug(job_receiver);

        let conn = UdpConnection::open(
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_SERVER_PORT)),
            Some(DHCP_CLIENT_PORT),
            session.clone(),
        )?;
        conn.set_dev_hint(dev.clone());
        *session.conn.lock() = Some(conn);
        SESSIONS.write().push(session.clone());

        session.transmit();
        Ok(session)
    }

    /// Blocking acquire for the shell's `dhcp` command
    pub fn configure(dev: &Arc<NetDevice>) -> Result<()> {
        let job = MonoJob::new();
        let session = Self::start(dev, job.clone())?;
        let rc = job.wait(Some(DEADLINE + 2 * TICKS_PER_SEC));
        if rc.is_err() {
            session.finish(rc);
        }
        rc
    }

    /// Transmit the packet for the current phase
    fn transmit(&self) {
        let mut state = self.state.lock();
        let message = match state.phase {
            Phase::Discover | Phase::ProxyWait => {
                build_discover(state.xid, self.dev.ll_addr().0, self.secs(&state))
            }
            Phase::Request => {
                let Some(offer) = &state.offer else { return };
                build_request(
                    state.xid,
                    self.dev.ll_addr().0,
                    self.secs(&state),
                    offer.yiaddr,
                    offer.server_id,
                )
            }
            Phase::Done => return,
        };
        state.timer.start();
        drop(state);

        if let Some(conn) = self.conn.lock().clone() {
            let iob = IoBuffer::from_slice(&message);
            if let Err(err) = conn.deliver(iob, &XferMeta::default()) {
                log::debug!("{} DHCP transmit failed: {err}", self.dev.name());
            }
        }
    }

    fn secs(&self, state: &SessionState) -> u16 {
        (currticks().wrapping_sub(state.start) / TICKS_PER_SEC).min(0xffff) as u16
    }

    /// Move from waiting-for-proxy to requesting
    fn begin_request(&self) {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::ProxyWait {
                return;
            }
            state.phase = Phase::Request;
            state.proxy_timer.stop();
            state.timer = RetryTimer::new(RETRY_MIN, RETRY_MAX);
        }
        self.transmit();
    }

    /// Store the lease and configure the interface
    fn finalize(&self, ack_areas: Vec<DhcpOptions>, yiaddr: Ipv4Addr, siaddr: Ipv4Addr) {
        // All options from the ACK land in the NIC's settings block
        let merged = merge_areas(&ack_areas);
        self.dev.settings().replace(merged);
        let _ = self
            .dev
            .settings()
            .store(tag::EB_YIADDR, Some(&yiaddr.octets()));
        if siaddr != Ipv4Addr::UNSPECIFIED {
            let _ = self
                .dev
                .settings()
                .store(tag::EB_SIADDR, Some(&siaddr.octets()));
        }

        // ProxyDHCP options form a lower-priority secondary block
        let proxy = self.state.lock().proxy.take();
        if let Some(proxy) = proxy {
            let block = SettingsBlock::from_options(
                "proxydhcp",
                100 + self.dev.index() as i32,
                proxy,
            );
            register_settings(block, None);
        }

        // Configure addressing from the lease
        let netmask = self
            .dev
            .settings()
            .fetch_ipv4(tag::SUBNET_MASK)
            .unwrap_or_else(|| classful_netmask(yiaddr));
        let gateway = self.dev.settings().fetch_ipv4(tag::ROUTERS);
        ipv4::add_miniroute(&self.dev, yiaddr, netmask, gateway);

        log::info!("{} leased {}", self.dev.name(), yiaddr);
        self.finish(Ok(()));
    }

    /// Tear the session down with a completion code
    fn finish(&self, rc: Result<()>) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }
            state.phase = Phase::Done;
            state.timer.stop();
            state.proxy_timer.stop();
        }
        if let Some(conn) = self.conn.lock().take() {
            conn.close(Ok(()));
        }
        SESSIONS.write().retain(|s| !core::ptr::eq(&**s, self));
        self.job.shutdown(rc);
    }

    /// Timer pass
    fn step(&self) {
        let now = currticks();
        let (expired, proxy_expired, past_deadline) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }
            (
                state.timer.expired(),
                state.proxy_timer.expired(),
                now.wrapping_sub(state.start) >= DEADLINE,
            )
        };

        if past_deadline {
            log::warn!("{} DHCP timed out", self.dev.name());
            self.finish(Err(Error::TimedOut));
            return;
        }
        if proxy_expired.is_some() {
            self.begin_request();
            return;
        }
        if expired.is_some() {
            // The per-packet retry ceiling never fires before the overall
            // deadline with these bounds; just retransmit with backoff
            log::debug!("{} DHCP retransmitting", self.dev.name());
            self.transmit();
        }
    }
}

impl XferTarget for DhcpSession {
    /// A datagram arrived on port 68
    fn deliver(&self, iobuf: IoBuffer, meta: &XferMeta) -> Result<()> {
        let Some(packet) = parse_packet(iobuf.as_ref()) else {
            return Ok(());
        };

        let mut state = self.state.lock();
        if state.phase == Phase::Done {
            return Ok(());
        }
        // Responses with the wrong XID or MAC are not ours
        if packet.xid != state.xid || packet.chaddr != self.dev.ll_addr().0 {
            return Ok(());
        }

        let msg_type = fetch_areas(&packet.areas, tag::MESSAGE_TYPE)
            .and_then(|v| v.first().copied())
            .unwrap_or(0);

        match (state.phase, msg_type) {
            (Phase::Discover | Phase::ProxyWait, DHCPOFFER) => {
                if packet.yiaddr == Ipv4Addr::UNSPECIFIED {
                    // An offer with no address is boot-parameter-only:
                    // ProxyDHCP
                    log::debug!("{} ProxyDHCP offer", self.dev.name());
                    state.proxy = Some(merge_areas(&packet.areas));
                    if state.phase == Phase::ProxyWait {
                        drop(state);
                        self.begin_request();
                    }
                    return Ok(());
                }

                let Some(server_id) = fetch_areas(&packet.areas, tag::SERVER_ID)
                    .and_then(|v| ipv4_from(&v))
                else {
                    return Ok(());
                };
                if state.offer.is_none() {
                    log::debug!(
                        "{} offer {} from {} (src {})",
                        self.dev.name(),
                        packet.yiaddr,
                        server_id,
                        meta.src.map(|s| s.ip().to_string()).unwrap_or_default()
                    );
                    state.offer = Some(Offer {
                        yiaddr: packet.yiaddr,
                        siaddr: packet.siaddr,
                        server_id,
                        options: merge_areas(&packet.areas),
                    });
                    state.phase = Phase::ProxyWait;
                    // Skip the linger when the offer says there is nothing
                    // to wait for
                    let no_proxy = state
                        .offer
                        .as_ref()
                        .and_then(|o| o.options.fetch(tag::EB_NO_PROXYDHCP))
                        .map(|v| v.first().copied().unwrap_or(0) != 0)
                        .unwrap_or(false);
                    if no_proxy || state.proxy.is_some() {
                        drop(state);
                        self.begin_request();
                    } else {
                        state.proxy_timer.start();
                    }
                }
                Ok(())
            }
            (Phase::Request, DHCPACK) => {
                let yiaddr = packet.yiaddr;
                let siaddr = packet.siaddr;
                let areas = packet.areas;
                drop(state);
                self.finalize(areas, yiaddr, siaddr);
                Ok(())
            }
            (Phase::Request, DHCPNAK) => {
                log::debug!("{} NAK; restarting discovery", self.dev.name());
                state.phase = Phase::Discover;
                state.xid = random::rand_u32();
                state.offer = None;
                state.proxy = None;
                state.timer = RetryTimer::new(RETRY_MIN, RETRY_MAX);
                drop(state);
                self.transmit();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn close(&self, _rc: Result<()>) {
        self.finish(Err(Error::Cancelled));
    }
}

impl core::fmt::Debug for DhcpSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DhcpSession")
            .field("dev", &self.dev.name())
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}

// ============================================================================
// Wire codec
// ============================================================================

struct Packet {
    xid: u32,
    yiaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
    chaddr: [u8; 6],
    /// Option areas in fallback order: options, file, sname
    areas: Vec<DhcpOptions>,
}

fn ipv4_from(raw: &[u8]) -> Option<Ipv4Addr> {
    match raw {
        [a, b, c, d, ..] => Some(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => None,
    }
}

/// Classful default mask for leases that omit option 1
fn classful_netmask(addr: Ipv4Addr) -> Ipv4Addr {
    let first = addr.octets()[0];
    if first < 128 {
        Ipv4Addr::new(255, 0, 0, 0)
    } else if first < 192 {
        Ipv4Addr::new(255, 255, 0, 0)
    } else {
        Ipv4Addr::new(255, 255, 255, 0)
    }
}

/// Fetch a tag across option areas in priority order
fn fetch_areas(areas: &[DhcpOptions], tag: Tag) -> Option<Vec<u8>> {
    areas.iter().find_map(|a| a.fetch(tag))
}

/// Merge option areas into one block (earlier areas win)
fn merge_areas(areas: &[DhcpOptions]) -> DhcpOptions {
    let mut merged = DhcpOptions::new();
    for area in areas.iter().rev() {
        // Walk every top-level tag by brute force; the areas are small
        for tag_byte in 1..=254u8 {
            let tag = Tag::new(tag_byte);
            if let Some(value) = area.fetch(tag) {
                let _ = merged.store(tag, Some(&value));
            }
        }
    }
    merged
}

fn parse_packet(data: &[u8]) -> Option<Packet> {
    if data.len() < BOOTP_HLEN + 4 + 64 + 128 {
        // Tolerate short vendor areas but require the fixed header + magic
        if data.len() < BOOTP_HLEN + 4 {
            return None;
        }
    }
    if data[0] != 2 {
        return None;
    }
    let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
    let mut chaddr = [0u8; 6];
    chaddr.copy_from_slice(&data[28..34]);

    let sname = &data[44..108];
    let file = &data[108..236];
    if data[BOOTP_HLEN..BOOTP_HLEN + 4] != DHCP_MAGIC {
        return None;
    }
    let options = DhcpOptions::from_bytes(&data[BOOTP_HLEN + 4..]);

    // Option 52: the file/sname fields may be overloaded with options
    let overload = options
        .fetch(tag::OVERLOADING)
        .and_then(|v| v.first().copied())
        .unwrap_or(0);
    let mut areas = alloc::vec![options];
    if overload & 1 != 0 {
        areas.push(DhcpOptions::from_bytes(file));
    }
    if overload & 2 != 0 {
        areas.push(DhcpOptions::from_bytes(sname));
    }

    Some(Packet {
        xid,
        yiaddr,
        siaddr,
        chaddr,
        areas,
    })
}

fn build_common(msg_type: u8, xid: u32, mac: [u8; 6], secs: u16) -> (Vec<u8>, DhcpOptions) {
    let mut out = alloc::vec![0u8; BOOTP_HLEN];
    out[0] = 1; // BOOTREQUEST
    out[1] = 1; // ethernet
    out[2] = 6;
    out[4..8].copy_from_slice(&xid.to_be_bytes());
    out[8..10].copy_from_slice(&secs.to_be_bytes());
    out[10..12].copy_from_slice(&0x8000u16.to_be_bytes()); // broadcast
    out[28..34].copy_from_slice(&mac);
    out.extend_from_slice(&DHCP_MAGIC);

    let mut options = DhcpOptions::new();
    let _ = options.store(tag::MESSAGE_TYPE, Some(&[msg_type]));
    let _ = options.store(tag::MAX_MESSAGE_SIZE, Some(&1472u16.to_be_bytes()));
    let _ = options.store(tag::VENDOR_CLASS_ID, Some(b"PXEClient"));
    let _ = options.store(
        tag::PARAMETER_REQUEST_LIST,
        Some(&[1, 3, 6, 12, 15, 17, 51, 54, 66, 67, 175]),
    );
    (out, options)
}

/// Build a DHCPDISCOVER
pub fn build_discover(xid: u32, mac: [u8; 6], secs: u16) -> Vec<u8> {
    let (mut out, options) = build_common(DHCPDISCOVER, xid, mac, secs);
    out.extend_from_slice(options.as_bytes());
    out.push(255);
    out
}

/// Build a DHCPREQUEST for an offered lease
pub fn build_request(
    xid: u32,
    mac: [u8; 6],
    secs: u16,
    requested: Ipv4Addr,
    server_id: Ipv4Addr,
) -> Vec<u8> {
    let (mut out, mut options) = build_common(DHCPREQUEST, xid, mac, secs);
    let _ = options.store(tag::REQUESTED_ADDR, Some(&requested.octets()));
    let _ = options.store(tag::SERVER_ID, Some(&server_id.octets()));
    out.extend_from_slice(options.as_bytes());
    out.push(255);
    out
}

struct DhcpProcess;

impl Process for DhcpProcess {
    fn name(&self) -> &str {
        "dhcp"
    }

    fn step(&self) {
        let sessions = SESSIONS.read().clone();
        for session in sessions {
            session.step();
        }
    }
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        process::register_process(Arc::new(DhcpProcess));
    });
}
