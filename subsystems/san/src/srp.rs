//! # SRP (SCSI RDMA Protocol)
//!
//! The PDU layer of an SRP initiator: LOGIN REQ/RSP, SRP_CMD with SCSI
//! CDBs, SRP_RSP completion. SRP normally rides an InfiniBand reliable
//! connection; the transport here is any stream delivered through the
//! interface graph, so the same code serves IB verbs glue or a test
//! harness. Failed commands retry up to the session ceiling.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process;
use cinder_kernel::uri::Uri;

use crate::block::{BlockDevice, Capacity};
use crate::device::{register_san_opener, SanOpener, SAN_COMMAND_TIMEOUT};

/// Retry ceiling for failed commands / relogins
pub const SRP_MAX_RETRIES: u32 = 2;

// Information unit types
const SRP_LOGIN_REQ: u8 = 0x00;
const SRP_CMD: u8 = 0x02;
const SRP_LOGIN_RSP: u8 = 0xc0;
const SRP_RSP: u8 = 0xc1;
const SRP_LOGIN_REJ: u8 = 0xc2;

/// Requested initiator-to-target IU size
const MAX_IU_LEN: u32 = 8192;

struct SrpState {
    logged_in: bool,
    login_rc: Option<Result<()>>,
    next_tag: u64,
    rx_buf: Vec<u8>,
    /// In-flight command: tag, data-in buffer, completion
    pending: Option<(u64, Vec<u8>, Option<Result<()>>)>,
}

/// An SRP session over a stream transport
pub struct SrpSession {
    /// Transport data interface (plugged to the IB connection glue)
    pub intf: Intf,
    state: Mutex<SrpState>,
}

impl SrpSession {
    /// Create a session; the caller plugs `intf` into its transport
    pub fn new() -> Arc<SrpSession> {
        Arc::new(SrpSession {
            intf: Intf::new(),
            state: Mutex::new(SrpState {
                logged_in: false,
                login_rc: None,
                next_tag: 1,
                rx_buf: Vec::new(),
                pending: None,
            }),
        })
    }

    /// Send the login request and block for the response
    pub fn login(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.logged_in = false;
            state.login_rc = None;
        }
        let mut iu = alloc::vec![0u8; 64];
        iu[0] = SRP_LOGIN_REQ;
        iu[8..16].copy_from_slice(&0u64.to_be_bytes()); // tag
        iu[16..20].copy_from_slice(&MAX_IU_LEN.to_be_bytes());
        // Buffer format: direct data descriptor
        iu[22..24].copy_from_slice(&0x0002u16.to_be_bytes());
        self.intf.deliver(IoBuffer::from_slice(&iu), &XferMeta::default())?;

        let done = process::wait_until(
            || self.state.lock().login_rc.is_some(),
            Some(SAN_COMMAND_TIMEOUT),
        );
        if !done {
            return Err(Error::TimedOut);
        }
        self.state.lock().login_rc.unwrap_or(Err(Error::Protocol))
    }

    /// Issue one SCSI command and block for the SRP_RSP
    fn scsi_command(&self, cdb: &[u8], read_len: usize) -> Result<Vec<u8>> {
        let tag = {
            let mut state = self.state.lock();
            if !state.logged_in {
                return Err(Error::ConnectionReset);
            }
            let tag = state.next_tag;
            state.next_tag += 1;
            state.pending = Some((tag, alloc::vec![0u8; read_len], None));
            tag
        };

        let mut iu = alloc::vec![0u8; 64];
        iu[0] = SRP_CMD;
        iu[8..16].copy_from_slice(&tag.to_be_bytes());
        // LUN 0, single-level
        iu[32..48][..cdb.len().min(16)].copy_from_slice(&cdb[..cdb.len().min(16)]);
        self.intf.deliver(IoBuffer::from_slice(&iu), &XferMeta::default())?;

        let done = process::wait_until(
            || {
                self.state
                    .lock()
                    .pending
                    .as_ref()
                    .map(|(_, _, status)| status.is_some())
                    .unwrap_or(true)
            },
            Some(SAN_COMMAND_TIMEOUT),
        );
        let mut state = self.state.lock();
        let (ptag, buf, status) = state.pending.take().ok_or(Error::ConnectionReset)?;
        if !done {
            return Err(Error::TimedOut);
        }
        if ptag != tag {
            return Err(Error::Protocol);
        }
        status.unwrap_or(Err(Error::TimedOut))?;
        Ok(buf)
    }

    fn process_iu(&self, iu: &[u8]) {
        match iu[0] {
            SRP_LOGIN_RSP => {
                let mut state = self.state.lock();
                state.logged_in = true;
                state.login_rc = Some(Ok(()));
                log::info!("SRP login complete");
            }
            SRP_LOGIN_REJ => {
                let mut state = self.state.lock();
                state.login_rc = Some(Err(Error::PermissionDenied));
            }
            SRP_RSP => {
                if iu.len() < 36 {
                    return;
                }
                let tag = u64::from_be_bytes([
                    iu[8], iu[9], iu[10], iu[11], iu[12], iu[13], iu[14], iu[15],
                ]);
                let status = iu[35];
                let mut state = self.state.lock();
                if let Some((ptag, buf, slot)) = state.pending.as_mut() {
                    if *ptag == tag && slot.is_none() {
                        // Any payload past the response header is data-in
                        let data = &iu[36..];
                        let take = data.len().min(buf.len());
                        buf[..take].copy_from_slice(&data[..take]);
                        *slot = Some(if status == 0 {
                            Ok(())
                        } else {
                            Err(Error::Platform(u32::from(status)))
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

impl Default for SrpSession {
    fn default() -> Self {
        SrpSession {
            intf: Intf::new(),
            state: Mutex::new(SrpState {
                logged_in: false,
                login_rc: None,
                next_tag: 1,
                rx_buf: Vec::new(),
                pending: None,
            }),
        }
    }
}

impl XferTarget for SrpSession {
    /// Transport bytes: SRP IUs are length-prefixed on a stream
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        self.state.lock().rx_buf.extend_from_slice(iobuf.as_ref());
        loop {
            let iu = {
                let mut state = self.state.lock();
                if state.rx_buf.len() < 4 {
                    return Ok(());
                }
                let len = u32::from_be_bytes([
                    state.rx_buf[0],
                    state.rx_buf[1],
                    state.rx_buf[2],
                    state.rx_buf[3],
                ]) as usize;
                if len < 1 || len > MAX_IU_LEN as usize {
                    state.rx_buf.clear();
                    return Err(Error::Protocol);
                }
                if state.rx_buf.len() < 4 + len {
                    return Ok(());
                }
                let iu: Vec<u8> = state.rx_buf.drain(..4 + len).skip(4).collect();
                iu
            };
            self.process_iu(&iu);
        }
    }

    fn close(&self, rc: Result<()>) {
        let mut state = self.state.lock();
        state.logged_in = false;
        let err = rc.err().unwrap_or(Error::ConnectionReset);
        if state.login_rc.is_none() {
            state.login_rc = Some(Err(err));
        }
        if let Some((_, _, slot)) = state.pending.as_mut() {
            if slot.is_none() {
                *slot = Some(Err(err));
            }
        }
    }
}

impl core::fmt::Debug for SrpSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SrpSession")
            .field("logged_in", &self.state.lock().logged_in)
            .finish()
    }
}

impl BlockDevice for SrpSession {
    fn read(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let mut last = Error::TimedOut;
        for _ in 0..=SRP_MAX_RETRIES {
            let mut cdb = [0u8; 16];
            cdb[0] = 0x88; // READ(16)
            cdb[2..10].copy_from_slice(&lba.to_be_bytes());
            cdb[10..14].copy_from_slice(&(count as u32).to_be_bytes());
            match self.scsi_command(&cdb, buf.len()) {
                Ok(data) => {
                    buf.copy_from_slice(&data[..buf.len()]);
                    return Ok(());
                }
                Err(err) => {
                    last = err;
                    let _ = self.login();
                }
            }
        }
        Err(last)
    }

    fn write(&self, _lba: u64, _count: usize, _buf: &[u8]) -> Result<()> {
        // Data-out descriptors need the RDMA plumbing the IB glue owns
        Err(Error::NotSupported)
    }

    fn capacity(&self) -> Result<Capacity> {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x9e;
        cdb[1] = 0x10;
        cdb[10..14].copy_from_slice(&32u32.to_be_bytes());
        let data = self.scsi_command(&cdb, 32)?;
        if data.len() < 12 {
            return Err(Error::Protocol);
        }
        let last_lba = u64::from_be_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);
        let block_size = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if block_size == 0 {
            return Err(Error::Protocol);
        }
        Ok(Capacity {
            block_size,
            blocks: last_lba + 1,
            max_xfer: (MAX_IU_LEN as usize / block_size).max(1),
        })
    }

    fn reset(&self) -> Result<()> {
        self.login()
    }
}

fn open_srp(_uri: &Uri) -> Result<Arc<dyn BlockDevice>> {
    // The IB connection glue (out of the core's scope) plugs the session's
    // interface into a reliable connection before login can proceed
    Err(Error::NotSupported)
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        register_san_opener(SanOpener {
            scheme: "srp",
            open: open_srp,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    struct Loopback {
        session: Mutex<Option<Arc<SrpSession>>>,
        saw_login: AtomicBool,
    }

    impl XferTarget for Loopback {
        fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
            let iu = iobuf.as_ref().to_vec();
            let Some(session) = self.session.lock().clone() else {
                return Ok(());
            };
            match iu[0] {
                SRP_LOGIN_REQ => {
                    self.saw_login.store(true, Ordering::Relaxed);
                    let mut rsp = alloc::vec![0u8; 36];
                    rsp[0] = SRP_LOGIN_RSP;
                    let mut framed = (rsp.len() as u32).to_be_bytes().to_vec();
                    framed.extend_from_slice(&rsp);
                    session
                        .deliver(IoBuffer::from_slice(&framed), &XferMeta::default())
                        .unwrap();
                }
                SRP_CMD => {
                    let mut rsp = alloc::vec![0u8; 36 + 4];
                    rsp[0] = SRP_RSP;
                    rsp[8..16].copy_from_slice(&iu[8..16]);
                    rsp[36..40].copy_from_slice(b"data");
                    let mut framed = (rsp.len() as u32).to_be_bytes().to_vec();
                    framed.extend_from_slice(&rsp);
                    session
                        .deliver(IoBuffer::from_slice(&framed), &XferMeta::default())
                        .unwrap();
                }
                _ => {}
            }
            Ok(())
        }

        fn close(&self, _rc: Result<()>) {}
    }

    #[test]
    fn login_and_command_round_trip() {
        let session = SrpSession::new();
        let loopback = Arc::new(Loopback {
            session: Mutex::new(Some(session.clone())),
            saw_login: AtomicBool::new(false),
        });
        session.intf.plug(loopback.clone());

        session.login().unwrap();
        assert!(loopback.saw_login.load(Ordering::Relaxed));

        let data = session.scsi_command(&[0x88; 16], 4).unwrap();
        assert_eq!(&data, b"data");
    }
}
