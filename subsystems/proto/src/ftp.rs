//! # FTP Client (RFC 959)
//!
//! Passive-mode retrieval only: the control channel walks the
//! USER/PASS/TYPE/PASV/RETR sequence and the data channel streams into the
//! downstream interface. Completion requires both the `226` control reply
//! and the data-channel EOF.

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, SocketAddr};

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::open::{register_opener, UriOpener};
use cinder_kernel::process::{self, Process};
use cinder_kernel::uri::{percent_decode, Uri};
use cinder_net::tcp::TcpConnection;

use crate::resolv::{self, NameResolution};

const FTP_PORT: u16 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolving,
    Greeting,
    User,
    Pass,
    Type,
    Pasv,
    Retr,
    Transfer,
    Done,
}

struct FtpState {
    phase: Phase,
    line_buf: Vec<u8>,
    /// 226 seen on the control channel
    complete_seen: bool,
    /// Data channel reached EOF
    data_closed: bool,
    offset: u64,
}

/// An FTP retrieval
pub struct FtpConnection {
    /// Downstream data interface
    pub intf: Intf,
    uri: Uri,
    resolution: Arc<NameResolution>,
    control: Mutex<Option<Arc<TcpConnection>>>,
    data: Mutex<Option<Arc<TcpConnection>>>,
    state: Mutex<FtpState>,
}

static CONNECTIONS: RwLock<Vec<Arc<FtpConnection>>> = RwLock::new(Vec::new());

/// Adapter placing the data channel's bytes onto the parent's interface
struct FtpDataSink {
    parent: Weak<FtpConnection>,
}

impl XferTarget for FtpDataSink {
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        let Some(parent) = self.parent.upgrade() else {
            return Ok(());
        };
        let offset = {
            let mut state = parent.state.lock();
            let offset = state.offset;
            state.offset += iobuf.len() as u64;
            offset
        };
        let meta = XferMeta {
            offset: Some(offset),
            ..Default::default()
        };
        parent.intf.deliver(iobuf, &meta)
    }

    fn close(&self, rc: Result<()>) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        match rc {
            Err(err) => parent.finish(Err(err)),
            Ok(()) => {
                let complete = {
                    let mut state = parent.state.lock();
                    state.data_closed = true;
                    state.complete_seen
                };
                if complete {
                    parent.finish(Ok(()));
                }
            }
        }
    }
}

impl FtpConnection {
    pub fn open_uri(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<FtpConnection>> {
        let host = uri.host.as_deref().ok_or(Error::InvalidArgument)?;
        let resolution = resolv::resolve(host, uri.port_or(FTP_PORT))?;
        let conn = Arc::new(FtpConnection {
            intf: Intf::new(),
            uri: uri.clone(),
            resolution,
            control: Mutex::new(None),
            data: Mutex::new(None),
            state: Mutex::new(FtpState {
                phase: Phase::Resolving,
                line_buf: Vec::new(),
                complete_seen: false,
                data_closed: false,
                offset: 0,
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
        }
        if let Some(control) = self.control.lock().take() {
            control.close(Ok(()));
        }
        if let Some(data) = self.data.lock().take() {
            data.close(Ok(()));
        }
        CONNECTIONS.write().retain(|c| !core::ptr::eq(&**c, self));
        self.intf.shutdown(rc);
    }

    fn send_command(&self, command: &str) {
        log::debug!("FTP > {command}");
        if let Some(control) = self.control.lock().clone() {
            let line = alloc::format!("{command}\r\n");
            let _ = control.deliver(IoBuffer::from_slice(line.as_bytes()), &XferMeta::default());
        }
    }

    /// Advance the command sequence on a final (non-continuation) reply
    fn process_reply(self: &Arc<Self>, code: u16, text: &str) {
        let phase = self.state.lock().phase;
        match (phase, code) {
            (Phase::Greeting, 220) => {
                let user = self
                    .uri
                    .user
                    .clone()
                    .unwrap_or_else(|| "anonymous".to_string());
                self.state.lock().phase = Phase::User;
                self.send_command(&alloc::format!("USER {user}"));
            }
            (Phase::User, 331) => {
                let password = self.uri.password.clone().unwrap_or_default();
                self.state.lock().phase = Phase::Pass;
                self.send_command(&alloc::format!("PASS {password}"));
            }
            (Phase::User | Phase::Pass, 230) => {
                self.state.lock().phase = Phase::Type;
                self.send_command("TYPE I");
            }
            (Phase::Type, 200) => {
                self.state.lock().phase = Phase::Pasv;
                self.send_command("PASV");
            }
            (Phase::Pasv, 227) => match parse_pasv(text) {
                Some(addr) => {
                    let sink = Arc::new(FtpDataSink {
                        parent: Arc::downgrade(self),
                    });
                    match TcpConnection::open(addr, sink) {
                        Ok(data) => {
                            *self.data.lock() = Some(data);
                            let path = percent_decode(
                                self.uri.path.as_deref().unwrap_or("/"),
                            );
                            self.state.lock().phase = Phase::Retr;
                            self.send_command(&alloc::format!("RETR {path}"));
                        }
                        Err(err) => self.finish(Err(err)),
                    }
                }
                None => self.finish(Err(Error::Protocol)),
            },
            (Phase::Retr, 125 | 150) => {
                self.state.lock().phase = Phase::Transfer;
            }
            (Phase::Retr | Phase::Transfer, 226) => {
                let done = {
                    let mut state = self.state.lock();
                    state.complete_seen = true;
                    state.data_closed
                };
                if done {
                    self.finish(Ok(()));
                }
            }
            (_, 550) => self.finish(Err(Error::NoSuchEntity)),
            (_, 530) => self.finish(Err(Error::PermissionDenied)),
            (_, code) if code >= 400 => self.finish(Err(Error::Protocol)),
            _ => {}
        }
    }

    fn step(self: &Arc<Self>) {
        let phase = self.state.lock().phase;
        if phase != Phase::Resolving {
            return;
        }
        match self.resolution.result() {
            Some(Ok(addr)) => {
                match TcpConnection::open(addr, self.clone()) {
                    Ok(control) => {
                        *self.control.lock() = Some(control);
                        self.state.lock().phase = Phase::Greeting;
                    }
                    Err(err) => self.finish(Err(err)),
                }
            }
            Some(Err(err)) => self.finish(Err(err)),
            None => {}
        }
    }
}

impl XferTarget for FtpConnection {
    /// Control-channel bytes
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        let conn = CONNECTIONS
            .read()
            .iter()
            .find(|c| core::ptr::eq(&***c, self))
            .cloned();
        let Some(conn) = conn else { return Ok(()) };

        let mut pending: Vec<(u16, String)> = Vec::new();
        {
            let mut state = self.state.lock();
            state.line_buf.extend_from_slice(iobuf.as_ref());
            while let Some(pos) = state.line_buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = state.line_buf.drain(..pos + 2).collect();
                let text = String::from_utf8_lossy(&line[..pos]).into_owned();
                log::debug!("FTP < {text}");
                // Final replies are "NNN text"; "NNN-" begins a multiline
                if text.len() >= 4 && text.as_bytes()[3] == b' ' {
                    if let Ok(code) = text[..3].parse::<u16>() {
                        pending.push((code, text));
                    }
                }
            }
        }
        for (code, text) in pending {
            conn.process_reply(code, &text);
        }
        Ok(())
    }

    fn close(&self, rc: Result<()>) {
        let phase = self.state.lock().phase;
        if phase != Phase::Done {
            self.finish(match rc {
                Ok(()) => Err(Error::ConnectionReset),
                err => err,
            });
        }
    }
}

impl core::fmt::Debug for FtpConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FtpConnection")
            .field("uri", &self.uri.unparse())
            .finish()
    }
}

/// Parse "227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)"
fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let mut parts = text[open + 1..close].split(',');
    let mut next = || -> Option<u8> { parts.next()?.trim().parse().ok() };
    let addr = Ipv4Addr::new(next()?, next()?, next()?, next()?);
    let port = (u16::from(next()?) << 8) | u16::from(next()?);
    Some(SocketAddr::new(IpAddr::V4(addr), port))
}

fn open_ftp(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
    Ok(FtpConnection::open_uri(uri, receiver)?)
}

struct FtpProcess;

impl Process for FtpProcess {
    fn name(&self) -> &str {
        "ftp"
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
        process::register_process(Arc::new(FtpProcess));
        register_opener(UriOpener {
            scheme: "ftp",
            open: open_ftp,
        });
    });
}
