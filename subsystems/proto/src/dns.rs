//! # DNS Resolver (RFC 1035)
//!
//! A UDP query engine: sequential 16-bit IDs, fixed one-second
//! retransmission up to the retry ceiling, CNAME chains followed to a
//! depth of 32, and an AAAA fallback when an A query draws a blank. The
//! nameserver and local search domain come from the settings tree.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process::{self, Process};
use cinder_kernel::retry::RetryTimer;
use cinder_kernel::ticks::TICKS_PER_SEC;
use cinder_net::udp::UdpConnection;
use cinder_settings::{root_settings, tag};

use crate::resolv::NameResolution;

const DNS_PORT: u16 = 53;
const QTYPE_A: u16 = 1;
const QTYPE_CNAME: u16 = 5;
const QTYPE_AAAA: u16 = 28;

/// CNAME chase budget
const MAX_CNAME_DEPTH: u8 = 32;

struct QueryState {
    id: u16,
    qname: String,
    qtype: u16,
    cname_budget: u8,
    timer: RetryTimer,
    done: bool,
}

/// An in-flight DNS query
pub struct DnsQuery {
    resolution: Arc<NameResolution>,
    conn: Mutex<Option<Arc<UdpConnection>>>,
    state: Mutex<QueryState>,
}

static QUERIES: RwLock<Vec<Arc<DnsQuery>>> = RwLock::new(Vec::new());
static NEXT_ID: Mutex<u16> = Mutex::new(0);

fn next_id() -> u16 {
    let mut id = NEXT_ID.lock();
    if *id == 0 {
        *id = cinder_kernel::random::rand_u16();
    }
    *id = id.wrapping_add(1);
    *id
}

/// Start an asynchronous lookup feeding `resolution`
pub fn lookup(name: &str, resolution: Arc<NameResolution>) -> Result<Arc<DnsQuery>> {
    let settings = root_settings();
    let server = settings
        .fetch_ipv4(tag::DNS_SERVERS)
        .ok_or(Error::NoSuchEntity)?;

    // Unqualified names pick up the local domain
    let qname = if !name.contains('.') {
        match settings.fetch_string(tag::DOMAIN_NAME) {
            Some(domain) => format!("{name}.{domain}"),
            None => name.to_string(),
        }
    } else {
        name.to_string()
    };

    let query = Arc::new(DnsQuery {
        resolution,
        conn: Mutex::new(None),
        state: Mutex::new(QueryState {
            id: next_id(),
            qname,
            qtype: QTYPE_A,
            cname_budget: MAX_CNAME_DEPTH,
            timer: RetryTimer::new(TICKS_PER_SEC, TICKS_PER_SEC),
            done: false,
        }),
    });

    let conn = UdpConnection::open(
        Some(SocketAddr::new(IpAddr::V4(server), DNS_PORT)),
        None,
        query.clone(),
    )?;
    *query.conn.lock() = Some(conn);
    QUERIES.write().push(query.clone());

    query.send();
    Ok(query)
}

impl DnsQuery {
    /// (Re)transmit the current question
    fn send(&self) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        let message = build_query(state.id, &state.qname, state.qtype);
        state.timer.start();
        drop(state);
        if let Some(conn) = self.conn.lock().clone() {
            let iob = IoBuffer::from_slice(&message);
            if let Err(err) = conn.deliver(iob, &XferMeta::default()) {
                log::debug!("DNS transmit failed: {err}");
            }
        }
    }

    fn finish(&self, rc: Result<IpAddr>) {
        {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            state.timer.stop();
        }
        match &rc {
            Ok(addr) => log::debug!("DNS resolved to {addr}"),
            Err(err) => log::debug!("DNS failed: {err}"),
        }
        self.resolution.complete(rc);
        if let Some(conn) = self.conn.lock().take() {
            conn.close(Ok(()));
        }
        QUERIES.write().retain(|q| !core::ptr::eq(&**q, self));
    }

    fn step(&self) {
        let expired = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.timer.expired()
        };
        match expired {
            Some(true) => self.finish(Err(Error::TimedOut)),
            Some(false) => {
                log::debug!("DNS retransmitting");
                self.send();
            }
            None => {}
        }
    }
}

impl XferTarget for DnsQuery {
    /// A reply datagram arrived
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        let mut state = self.state.lock();
        if state.done {
            return Ok(());
        }
        let reply = match parse_reply(iobuf.as_ref(), state.id, &state.qname) {
            Some(reply) => reply,
            None => return Ok(()),
        };

        match reply {
            Reply::Address(addr) => {
                drop(state);
                self.finish(Ok(addr));
            }
            Reply::Cname(target) => {
                if state.cname_budget == 0 {
                    drop(state);
                    self.finish(Err(Error::Protocol));
                    return Ok(());
                }
                state.cname_budget -= 1;
                state.qname = target;
                state.id = next_id();
                drop(state);
                self.send();
            }
            Reply::NoSuchName => {
                if state.qtype == QTYPE_A {
                    // Fall back to an AAAA query before giving up
                    state.qtype = QTYPE_AAAA;
                    state.id = next_id();
                    drop(state);
                    self.send();
                } else {
                    drop(state);
                    self.finish(Err(Error::NoSuchEntity));
                }
            }
        }
        Ok(())
    }

    fn close(&self, _rc: Result<()>) {
        self.finish(Err(Error::Cancelled));
    }
}

impl core::fmt::Debug for DnsQuery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DnsQuery")
            .field("qname", &self.state.lock().qname)
            .finish()
    }
}

// ============================================================================
// Wire codec
// ============================================================================

/// Append a dot-separated name as DNS labels
fn encode_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len().min(63) as u8);
        out.extend_from_slice(&label.as_bytes()[..label.len().min(63)]);
    }
    out.push(0);
}

/// Build a recursion-desired query message
fn build_query(id: u16, qname: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + qname.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0; 6]); // AN/NS/AR
    encode_name(&mut out, qname);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // IN
    out
}

/// Decode a (possibly compressed) name starting at `offset`
///
/// Returns the name and the offset just past it in the original stream.
fn decode_name(message: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut end: Option<usize> = None;
    let mut hops = 0;
    loop {
        let &len = message.get(offset)?;
        if len & 0xc0 == 0xc0 {
            // Compression pointer
            let &low = message.get(offset + 1)?;
            if end.is_none() {
                end = Some(offset + 2);
            }
            offset = usize::from(u16::from_be_bytes([len & 0x3f, low]));
            hops += 1;
            if hops > 32 {
                return None;
            }
            continue;
        }
        if len == 0 {
            offset += 1;
            break;
        }
        let label = message.get(offset + 1..offset + 1 + usize::from(len))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        offset += 1 + usize::from(len);
    }
    Some((name, end.unwrap_or(offset)))
}

enum Reply {
    Address(IpAddr),
    Cname(String),
    NoSuchName,
}

/// Parse a reply, returning the first usable answer for `qname`
fn parse_reply(message: &[u8], expect_id: u16, qname: &str) -> Option<Reply> {
    if message.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([message[0], message[1]]);
    let flags = u16::from_be_bytes([message[2], message[3]]);
    if id != expect_id || flags & 0x8000 == 0 {
        return None;
    }
    let rcode = flags & 0x000f;
    if rcode == 3 {
        return Some(Reply::NoSuchName);
    }
    if rcode != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([message[4], message[5]]);
    let ancount = u16::from_be_bytes([message[6], message[7]]);

    // Skip questions
    let mut offset = 12;
    for _ in 0..qdcount {
        let (_, next) = decode_name(message, offset)?;
        offset = next + 4;
    }

    // Walk answers, chasing CNAMEs within this message
    let mut target = qname.to_string();
    let mut pending_cname: Option<String> = None;
    for _ in 0..ancount {
        let (owner, next) = decode_name(message, offset)?;
        let rtype = u16::from_be_bytes([*message.get(next)?, *message.get(next + 1)?]);
        let rdlength = usize::from(u16::from_be_bytes([
            *message.get(next + 8)?,
            *message.get(next + 9)?,
        ]));
        let rdata = message.get(next + 10..next + 10 + rdlength)?;
        offset = next + 10 + rdlength;

        if !owner.eq_ignore_ascii_case(&target) {
            continue;
        }
        match rtype {
            QTYPE_A if rdlength == 4 => {
                return Some(Reply::Address(IpAddr::V4(Ipv4Addr::new(
                    rdata[0], rdata[1], rdata[2], rdata[3],
                ))));
            }
            QTYPE_AAAA if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                return Some(Reply::Address(IpAddr::V6(Ipv6Addr::from(octets))));
            }
            QTYPE_CNAME => {
                let (cname, _) = decode_name(message, next + 10)?;
                target = cname.clone();
                pending_cname = Some(cname);
            }
            _ => {}
        }
    }

    // A CNAME with no in-message address: re-query the new target
    pending_cname.map(Reply::Cname)
}

struct DnsProcess;

impl Process for DnsProcess {
    fn name(&self) -> &str {
        "dns"
    }

    fn step(&self) {
        let queries = QUERIES.read().clone();
        for query in queries {
            query.step();
        }
    }
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        process::register_process(Arc::new(DnsProcess));
    });
}
