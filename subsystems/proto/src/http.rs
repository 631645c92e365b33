//! # HTTP/1.1 Client (RFC 7230-7235)
//!
//! Request writer and response parser over any stream transport. The
//! transport is pluggable so HTTPS composes the identical state machine on
//! top of a TLS connection. Responses are framed by `Content-Length`,
//! chunked transfer coding, or connection close; 3xx redirects re-open the
//! fetch against the resolved location, up to a per-fetch limit.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::SocketAddr;

use spin::{Mutex, RwLock};

use cinder_kernel::base64;
use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::open::{open_uri, register_opener, UriOpener};
use cinder_kernel::process::{self, Process};
use cinder_kernel::uri::{resolve_uri, Uri};
use cinder_net::tcp::TcpConnection;

use crate::resolv::{self, NameResolution};

/// Redirect ceiling per fetch
pub const MAX_REDIRECTS: u8 = 10;

/// Transport constructor: plain TCP for http, TLS-over-TCP for https
pub type TransportFactory =
    fn(addr: SocketAddr, server_name: &str, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolving,
    Header,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataEnd,
    Trailer,
}

struct HttpState {
    phase: Phase,
    rx_buf: Vec<u8>,
    status: u16,
    chunked: bool,
    chunk_phase: ChunkPhase,
    chunk_remaining: usize,
    content_length: Option<u64>,
    body_received: u64,
    location: Option<String>,
    redirects_left: u8,
}

/// An HTTP fetch in flight
pub struct HttpConnection {
    /// Downstream data interface
    pub intf: Intf,
    uri: Uri,
    factory: TransportFactory,
    resolution: Arc<NameResolution>,
    transport: Mutex<Option<Arc<dyn XferTarget>>>,
    state: Mutex<HttpState>,
}

static CONNECTIONS: RwLock<Vec<Arc<HttpConnection>>> = RwLock::new(Vec::new());

impl HttpConnection {
    /// Open a fetch with an explicit transport factory and default port
    pub fn open_with(
        uri: &Uri,
        receiver: Arc<dyn XferTarget>,
        factory: TransportFactory,
        default_port: u16,
        redirects_left: u8,
    ) -> Result<Arc<HttpConnection>> {
        let host = uri.host.as_deref().ok_or(Error::InvalidArgument)?;
        let resolution = resolv::resolve(host, uri.port_or(default_port))?;
        let conn = Arc::new(HttpConnection {
            intf: Intf::new(),
            uri: uri.clone(),
            factory,
            resolution,
            transport: Mutex::new(None),
            state: Mutex::new(HttpState {
                phase: Phase::Resolving,
                rx_buf: Vec::new(),
                status: 0,
                chunked: false,
                chunk_phase: ChunkPhase::Size,
                chunk_remaining: 0,
                content_length: None,
                body_received: 0,
                location: None,
                redirects_left,
            }),
        });
        conn.intf.plug(receiver);
        CONNECTIONS.write().push(conn.clone());
        Ok(conn)
    }

    /// Serialise the request line and headers
    fn build_request(&self) -> Vec<u8> {
        let path = {
            let mut path = self.uri.path.clone().unwrap_or_else(|| "/".to_string());
            if let Some(query) = &self.uri.query {
                path.push('?');
                path.push_str(query);
            }
            path
        };
        let host = self.uri.host.as_deref().unwrap_or("");
        let mut req = String::new();
        req.push_str(&alloc::format!("GET {path} HTTP/1.1\r\n"));
        match &self.uri.port {
            Some(port) => req.push_str(&alloc::format!("Host: {host}:{port}\r\n")),
            None => req.push_str(&alloc::format!("Host: {host}\r\n")),
        }
        req.push_str("User-Agent: cinder/0.1\r\n");
        req.push_str("Connection: keep-alive\r\n");
        if let Some(user) = &self.uri.user {
            let password = self.uri.password.as_deref().unwrap_or("");
            let credentials = alloc::format!("{user}:{password}");
            req.push_str(&alloc::format!(
                "Authorization: Basic {}\r\n",
                base64::encode(credentials.as_bytes())
            ));
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    fn finish(&self, rc: Result<()>) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Done {
                return;
            }
            state.phase = Phase::Done;
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close(Ok(()));
        }
        CONNECTIONS.write().retain(|c| !core::ptr::eq(&**c, self));
        self.intf.shutdown(rc);
    }

    /// Re-drive the fetch at a redirect target
    fn redirect(&self, location: &str) {
        let redirects_left = self.state.lock().redirects_left;
        if redirects_left == 0 {
            log::warn!("redirect limit exceeded at {location}");
            self.finish(Err(Error::Protocol));
            return;
        }
        let target = resolve_uri(Some(&self.uri), &Uri::parse(location));
        log::info!("redirecting to {target}");

        // Hand the downstream receiver to a fresh connection
        let Some(receiver) = self.intf.dest() else {
            self.finish(Err(Error::Cancelled));
            return;
        };
        self.intf.unplug();
        {
            let mut state = self.state.lock();
            state.phase = Phase::Done;
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close(Ok(()));
        }
        CONNECTIONS.write().retain(|c| !core::ptr::eq(&**c, self));

        let rc = match target.scheme.as_deref() {
            Some("http") => {
                HttpConnection::open_with(&target, receiver.clone(), tcp_factory, 80,
                                          redirects_left - 1)
                    .map(|_| ())
            }
            _ => open_uri(&target, receiver.clone()).map(|_| ()),
        };
        if let Err(err) = rc {
            receiver.close(Err(err));
        }
    }

    /// Parse the status line + headers once the blank line arrives
    fn process_header(&self) -> Option<()> {
        let mut state = self.state.lock();
        let end = find_header_end(&state.rx_buf)?;
        let header_text = String::from_utf8_lossy(&state.rx_buf[..end]).into_owned();
        state.rx_buf.drain(..end + 4);

        let mut lines = header_text.split("\r\n");
        let status_line = lines.next().unwrap_or("");
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        state.status = status;

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                "content-length" => state.content_length = value.parse().ok(),
                "transfer-encoding" => {
                    state.chunked = value.eq_ignore_ascii_case("chunked");
                }
                "location" => state.location = Some(value.to_string()),
                _ => {}
            }
        }
        state.phase = Phase::Body;
        log::debug!("HTTP {} ({:?} bytes)", status, state.content_length);
        Some(())
    }

    /// Map the response status, then stream or redirect
    fn dispatch_status(&self) {
        let (status, location) = {
            let state = self.state.lock();
            (state.status, state.location.clone())
        };
        match status {
            200..=299 => {
                // Stream whatever body bytes arrived with the header
                self.process_body();
            }
            301 | 302 | 303 | 307 | 308 => {
                match location {
                    Some(location) => self.redirect(&location),
                    None => self.finish(Err(Error::Protocol)),
                }
            }
            401 | 403 => self.finish(Err(Error::PermissionDenied)),
            404 | 410 => self.finish(Err(Error::NoSuchEntity)),
            _ => self.finish(Err(Error::Protocol)),
        }
    }

    /// Deliver buffered body bytes downstream according to the framing
    fn process_body(&self) {
        loop {
            let mut state = self.state.lock();
            if state.phase != Phase::Body {
                return;
            }
            if state.rx_buf.is_empty() {
                // A zero-length (or already satisfied) length-framed body
                // completes without any further bytes
                let complete = !state.chunked
                    && state
                        .content_length
                        .map(|total| state.body_received >= total)
                        .unwrap_or(false);
                drop(state);
                if complete {
                    self.finish(Ok(()));
                }
                return;
            }

            if state.chunked {
                match state.chunk_phase {
                    ChunkPhase::Size => {
                        let Some(line_end) = find_crlf(&state.rx_buf) else {
                            return;
                        };
                        let line: Vec<u8> = state.rx_buf.drain(..line_end + 2).collect();
                        let size_text = String::from_utf8_lossy(&line[..line_end]);
                        let size_text = size_text.split(';').next().unwrap_or("").trim();
                        let Ok(size) = usize::from_str_radix(size_text, 16) else {
                            drop(state);
                            self.finish(Err(Error::Protocol));
                            return;
                        };
                        if size == 0 {
                            state.chunk_phase = ChunkPhase::Trailer;
                        } else {
                            state.chunk_remaining = size;
                            state.chunk_phase = ChunkPhase::Data;
                        }
                    }
                    ChunkPhase::Data => {
                        let take = state.chunk_remaining.min(state.rx_buf.len());
                        let payload: Vec<u8> = state.rx_buf.drain(..take).collect();
                        state.chunk_remaining -= take;
                        if state.chunk_remaining == 0 {
                            state.chunk_phase = ChunkPhase::DataEnd;
                        }
                        let offset = state.body_received;
                        state.body_received += payload.len() as u64;
                        drop(state);
                        let meta = XferMeta {
                            offset: Some(offset),
                            ..Default::default()
                        };
                        let _ = self.intf.deliver(IoBuffer::from_slice(&payload), &meta);
                        continue;
                    }
                    ChunkPhase::DataEnd => {
                        if state.rx_buf.len() < 2 {
                            return;
                        }
                        state.rx_buf.drain(..2);
                        state.chunk_phase = ChunkPhase::Size;
                    }
                    ChunkPhase::Trailer => {
                        // Swallow trailers until the terminating blank line
                        let Some(line_end) = find_crlf(&state.rx_buf) else {
                            return;
                        };
                        let line: Vec<u8> = state.rx_buf.drain(..line_end + 2).collect();
                        if line.len() == 2 {
                            drop(state);
                            self.finish(Ok(()));
                            return;
                        }
                    }
                }
                continue;
            }

            // Length-framed or EOF-framed
            let available = state.rx_buf.len() as u64;
            let take = match state.content_length {
                Some(total) => available.min(total - state.body_received),
                None => available,
            } as usize;
            let payload: Vec<u8> = state.rx_buf.drain(..take).collect();
            let offset = state.body_received;
            state.body_received += payload.len() as u64;
            let complete = state
                .content_length
                .map(|total| state.body_received >= total)
                .unwrap_or(false);
            drop(state);

            if !payload.is_empty() {
                let meta = XferMeta {
                    offset: Some(offset),
                    ..Default::default()
                };
                let _ = self.intf.deliver(IoBuffer::from_slice(&payload), &meta);
            }
            if complete {
                self.finish(Ok(()));
            }
            return;
        }
    }

    fn step(&self) {
        let phase = self.state.lock().phase;
        if phase != Phase::Resolving {
            return;
        }
        match self.resolution.result() {
            Some(Ok(addr)) => {
                let host = self.uri.host.clone().unwrap_or_default();
                let conn = CONNECTIONS
                    .read()
                    .iter()
                    .find(|c| core::ptr::eq(&***c, self))
                    .cloned();
                let Some(conn) = conn else { return };
                match (self.factory)(addr, &host, conn) {
                    Ok(transport) => {
                        let request = self.build_request();
                        let rc = transport.deliver(
                            IoBuffer::from_slice(&request),
                            &XferMeta::default(),
                        );
                        *self.transport.lock() = Some(transport);
                        self.state.lock().phase = Phase::Header;
                        if let Err(err) = rc {
                            self.finish(Err(err));
                        }
                    }
                    Err(err) => self.finish(Err(err)),
                }
            }
            Some(Err(err)) => self.finish(Err(err)),
            None => {}
        }
    }
}

impl XferTarget for HttpConnection {
    /// Response bytes from the transport
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Done {
                return Ok(());
            }
            state.rx_buf.extend_from_slice(iobuf.as_ref());
        }
        let phase = self.state.lock().phase;
        match phase {
            Phase::Header => {
                if self.process_header().is_some() {
                    self.dispatch_status();
                }
                Ok(())
            }
            Phase::Body => {
                self.process_body();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Transport closed (EOF or error)
    fn close(&self, rc: Result<()>) {
        let state = self.state.lock();
        let phase = state.phase;
        let eof_framed = phase == Phase::Body && state.content_length.is_none() && !state.chunked;
        drop(state);
        match (phase, rc) {
            (Phase::Done, _) => {}
            (_, Err(err)) => self.finish(Err(err)),
            (Phase::Body, Ok(())) if eof_framed => self.finish(Ok(())),
            (_, Ok(())) => self.finish(Err(Error::ConnectionReset)),
        }
    }
}

impl core::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("uri", &self.uri.unparse())
            .finish()
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Plain TCP transport for http
pub fn tcp_factory(
    addr: SocketAddr,
    _server_name: &str,
    receiver: Arc<dyn XferTarget>,
) -> Result<Arc<dyn XferTarget>> {
    Ok(TcpConnection::open(addr, receiver)?)
}

fn open_http(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
    Ok(HttpConnection::open_with(uri, receiver, tcp_factory, 80, MAX_REDIRECTS)?)
}

struct HttpProcess;

impl Process for HttpProcess {
    fn name(&self) -> &str {
        "http"
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
        process::register_process(Arc::new(HttpProcess));
        register_opener(UriOpener {
            scheme: "http",
            open: open_http,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn conn_in_header_phase(uri: &str) -> (Arc<HttpConnection>, Arc<Collector>) {
        let collector = Collector::new();
        let conn = HttpConnection::open_with(
            &Uri::parse(uri),
            collector.clone(),
            tcp_factory,
            80,
            MAX_REDIRECTS,
        )
        .unwrap();
        conn.state.lock().phase = Phase::Header;
        (conn, collector)
    }

    fn inject(conn: &Arc<HttpConnection>, bytes: &[u8]) {
        conn.deliver(IoBuffer::from_slice(bytes), &XferMeta::default())
            .unwrap();
    }

    #[test]
    fn request_format() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, _collector) = conn_in_header_phase("http://user:pw@boot.example.com/path?x=1");
        let request = String::from_utf8(conn.build_request()).unwrap();
        assert!(request.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(request.contains("Host: boot.example.com\r\n"));
        assert!(request.contains("Connection: keep-alive\r\n"));
        assert!(request.contains("Authorization: Basic dXNlcjpwdw==\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
        conn.finish(Err(Error::Cancelled));
    }

    #[test]
    fn content_length_framing() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = conn_in_header_phase("http://h/f");
        inject(&conn, b"HTTP/1.1 200 OK\r\nContent-Length: 16\r\n\r\n#!ipxe\n");
        assert_eq!(collector.data.lock().as_slice(), b"#!ipxe\n");
        assert!(collector.closed.lock().is_none());
        inject(&conn, b"echo hi\n\0");
        // 16 bytes total: "#!ipxe\necho hi\n" is 15 + NUL = 16
        assert_eq!(*collector.closed.lock(), Some(Ok(())));
    }

    #[test]
    fn chunked_framing_across_fragments() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = conn_in_header_phase("http://h/f");
        inject(
            &conn,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        inject(&conn, b"4\r\nboot\r\n");
        inject(&conn, b"3\r\nimg");
        inject(&conn, b"\r\n0\r\n\r\n");
        assert_eq!(collector.data.lock().as_slice(), b"bootimg");
        assert_eq!(*collector.closed.lock(), Some(Ok(())));
    }

    #[test]
    fn header_split_across_segments() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = conn_in_header_phase("http://h/f");
        inject(&conn, b"HTTP/1.1 200 OK\r\nContent-");
        inject(&conn, b"Length: 2\r\n\r\nok");
        assert_eq!(collector.data.lock().as_slice(), b"ok");
        assert_eq!(*collector.closed.lock(), Some(Ok(())));
    }

    #[test]
    fn not_found_maps_to_no_such_entity() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = conn_in_header_phase("http://h/f");
        inject(&conn, b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(*collector.closed.lock(), Some(Err(Error::NoSuchEntity)));
        let _ = conn;
    }

    #[test]
    fn eof_framed_body() {
        let _guard = crate::TEST_MUTEX.lock();
        let (conn, collector) = conn_in_header_phase("http://h/f");
        inject(&conn, b"HTTP/1.1 200 OK\r\n\r\nstream");
        assert_eq!(collector.data.lock().as_slice(), b"stream");
        // Transport EOF completes the fetch
        conn.close(Ok(()));
        assert_eq!(*collector.closed.lock(), Some(Ok(())));
    }
}
