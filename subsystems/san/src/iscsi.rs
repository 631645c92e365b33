//! # iSCSI Initiator (RFC 7143 subset)
//!
//! A single-connection normal session: login negotiation (optionally
//! CHAP-authenticated, one-way or mutual), then SCSI over the
//! full-feature phase. Commands carry incrementing initiator task tags
//! and CmdSNs; Data-In PDUs stitch into the caller's buffer by offset,
//! R2Ts drive solicited Data-Out. Login keys are negotiated as
//! null-terminated `key=value` pairs per the RFC.
//!
//! The block-device face is blocking: each command spins the scheduler
//! until its response lands or the SAN command timeout expires.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process;
use cinder_kernel::random;
use cinder_kernel::uri::Uri;
use cinder_net::tcp::TcpConnection;
use cinder_settings::{root_settings, tag};
use cinder_crypto::digest::Digest;
use cinder_crypto::md5::Md5;

use crate::block::{BlockDevice, Capacity};
use crate::device::{register_san_opener, SanOpener, SAN_COMMAND_TIMEOUT};
use crate::resolve_blocking;

type KeyList = Vec<(String, String)>;

pub const ISCSI_PORT: u16 = 3260;

/// Data segment size we advertise
const MAX_RECV_DSL: usize = 8192;

/// Session recovery ceiling
const MAX_SESSION_RETRIES: u32 = 2;

const BHS_LEN: usize = 48;

// Opcodes
const OP_NOP_OUT: u8 = 0x00;
const OP_SCSI_CMD: u8 = 0x01;
const OP_LOGIN_REQ: u8 = 0x03;
const OP_DATA_OUT: u8 = 0x05;
const OP_NOP_IN: u8 = 0x20;
const OP_SCSI_RSP: u8 = 0x21;
const OP_LOGIN_RSP: u8 = 0x23;
const OP_DATA_IN: u8 = 0x25;
const OP_R2T: u8 = 0x31;
const OP_REJECT: u8 = 0x3f;

const IMMEDIATE: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SecurityNegotiation,
    OperationalNegotiation,
    FullFeature,
    Failed,
}

/// An in-flight SCSI command
struct Pending {
    itt: u32,
    /// Data-In accumulation (read commands)
    buf: Vec<u8>,
    /// Data to transmit on R2T (write commands)
    out_data: Vec<u8>,
    status: Option<Result<()>>,
}

struct IscsiState {
    phase: Phase,
    rx_buf: Vec<u8>,
    isid: [u8; 6],
    tsih: u16,
    cmd_sn: u32,
    exp_stat_sn: u32,
    next_itt: u32,
    /// Target's MaxRecvDataSegmentLength governs our Data-Out
    target_max_dsl: usize,
    pending: Option<Pending>,
    login_rc: Option<Result<()>>,
    chap_reply: Option<KeyList>,
    chap_stage: u8,
}

/// Session parameters fixed at connect time
struct SessionParams {
    target_name: String,
    initiator_name: String,
    lun: u64,
    chap: Option<(String, String)>,
}

/// An iSCSI session
pub struct IscsiSession {
    params: SessionParams,
    target: core::net::SocketAddr,
    tcp: Mutex<Option<Arc<TcpConnection>>>,
    state: Mutex<IscsiState>,
}

impl IscsiSession {
    /// Parse an iSCSI root path: `iscsi:<server>:<proto>:<port>:<lun>:<iqn>`
    pub fn parse_root_path(opaque: &str) -> Result<(String, u16, u64, String)> {
        let mut parts = opaque.splitn(5, ':');
        let server = parts.next().filter(|s| !s.is_empty()).ok_or(Error::InvalidArgument)?;
        let _protocol = parts.next().unwrap_or("");
        let port = parts
            .next()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .unwrap_or(ISCSI_PORT);
        let lun = parts
            .next()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let target = parts.next().filter(|s| !s.is_empty()).ok_or(Error::InvalidArgument)?;
        Ok((server.to_string(), port, lun, target.to_string()))
    }

    /// Connect and log in (blocking)
    pub fn connect(uri: &Uri) -> Result<Arc<IscsiSession>> {
        let opaque = uri.opaque.as_deref().ok_or(Error::InvalidArgument)?;
        let (server, port, lun, target_name) = Self::parse_root_path(opaque)?;
        let target = resolve_blocking(&server, port)?;

        let settings = root_settings();
        let initiator_name = settings
            .fetch_string(tag::ISCSI_INITIATOR_IQN)
            .unwrap_or_else(|| format!("iqn.2010-04.org.cinder:{:08x}", random::rand_u32()));
        let chap = match (
            settings.fetch_string(tag::EB_USERNAME),
            settings.fetch_string(tag::EB_PASSWORD),
        ) {
            (Some(user), Some(secret)) => Some((user, secret)),
            _ => None,
        };

        let mut isid = [0u8; 6];
        random::fill(&mut isid);
        isid[0] = 0x80; // random format

        let session = Arc::new(IscsiSession {
            params: SessionParams {
                target_name,
                initiator_name,
                lun,
                chap,
            },
            target,
            tcp: Mutex::new(None),
            state: Mutex::new(IscsiState {
                phase: Phase::OperationalNegotiation,
                rx_buf: Vec::new(),
                isid,
                tsih: 0,
                cmd_sn: 1,
                exp_stat_sn: 0,
                next_itt: 1,
                target_max_dsl: 512,
                pending: None,
                login_rc: None,
                chap_reply: None,
                chap_stage: 0,
            }),
        });
        session.login()?;
        Ok(session)
    }

    /// Open the TCP connection and drive the login phase to completion
    fn login(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.rx_buf.clear();
            state.pending = None;
            state.login_rc = None;
            state.phase = if self.params.chap.is_some() {
                Phase::SecurityNegotiation
            } else {
                Phase::OperationalNegotiation
            };
        }
        let tcp = TcpConnection::open(self.target, self.clone() as Arc<dyn XferTarget>)?;
        *self.tcp.lock() = Some(tcp);

        self.send_login_request()?;
        let done = process::wait_until(
            || self.state.lock().login_rc.is_some(),
            Some(SAN_COMMAND_TIMEOUT),
        );
        if !done {
            self.teardown();
            return Err(Error::TimedOut);
        }
        let rc = self.state.lock().login_rc.unwrap_or(Err(Error::Protocol));
        if rc.is_err() {
            self.teardown();
        }
        rc
    }

    fn teardown(&self) {
        if let Some(tcp) = self.tcp.lock().take() {
            tcp.abort();
        }
    }

    /// Build and send a login request for the current stage
    fn send_login_request(&self) -> Result<()> {
        let mut state = self.state.lock();
        let (csg, nsg, keys): (u8, u8, Vec<(String, String)>) = match state.phase {
            Phase::SecurityNegotiation => {
                let mut keys = self.common_login_keys();
                match state.chap_stage {
                    0 => {
                        keys.push(("AuthMethod".into(), "CHAP".into()));
                        (0, 0, keys)
                    }
                    1 => {
                        keys.push(("CHAP_A".into(), "5".into()));
                        (0, 0, keys)
                    }
                    _ => {
                        // Challenge answered: ask to move to the
                        // operational stage
                        if let Some(mut reply) = state.chap_reply.take() {
                            keys.append(&mut reply);
                        }
                        (0, 1, keys)
                    }
                }
            }
            Phase::OperationalNegotiation => {
                let mut keys = self.common_login_keys();
                keys.push(("AuthMethod".into(), "None".into()));
                keys.extend(self.operational_keys());
                (1, 3, keys)
            }
            _ => return Err(Error::InvalidArgument),
        };

        let mut text = Vec::new();
        for (key, value) in keys {
            text.extend_from_slice(key.as_bytes());
            text.push(b'=');
            text.extend_from_slice(value.as_bytes());
            text.push(0);
        }

        let mut bhs = [0u8; BHS_LEN];
        bhs[0] = OP_LOGIN_REQ | IMMEDIATE;
        // Transit flag + CSG/NSG
        let transit = if nsg > 0 { 0x80 } else { 0x00 };
        bhs[1] = transit | (csg << 2) | nsg;
        bhs[2] = 0x00; // version-max
        bhs[3] = 0x00; // version-min
        bhs[5..8].copy_from_slice(&dsl_bytes(text.len()));
        bhs[8..14].copy_from_slice(&state.isid);
        bhs[14..16].copy_from_slice(&state.tsih.to_be_bytes());
        bhs[16..20].copy_from_slice(&state.next_itt.to_be_bytes());
        bhs[24..28].copy_from_slice(&state.cmd_sn.to_be_bytes());
        bhs[28..32].copy_from_slice(&state.exp_stat_sn.to_be_bytes());
        drop(state);

        self.send_pdu(&bhs, &text)
    }

    fn common_login_keys(&self) -> Vec<(String, String)> {
        alloc::vec![
            ("InitiatorName".into(), self.params.initiator_name.clone()),
            ("TargetName".into(), self.params.target_name.clone()),
            ("SessionType".into(), "Normal".into()),
        ]
    }

    fn operational_keys(&self) -> Vec<(String, String)> {
        alloc::vec![
            ("HeaderDigest".into(), "None".into()),
            ("DataDigest".into(), "None".into()),
            ("MaxRecvDataSegmentLength".into(), MAX_RECV_DSL.to_string()),
        ]
    }

    /// Frame a PDU (BHS + padded data segment) onto the TCP stream
    fn send_pdu(&self, bhs: &[u8; BHS_LEN], data: &[u8]) -> Result<()> {
        let mut pdu = Vec::with_capacity(BHS_LEN + data.len() + 3);
        pdu.extend_from_slice(bhs);
        pdu.extend_from_slice(data);
        while pdu.len() % 4 != 0 {
            pdu.push(0);
        }
        let tcp = self.tcp.lock().clone().ok_or(Error::NetUnreachable)?;
        tcp.deliver(IoBuffer::from_slice(&pdu), &XferMeta::default())
    }

    // ========================================================================
    // Login response processing
    // ========================================================================

    fn process_login_response(&self, bhs: &[u8], data: &[u8]) {
        let status_class = bhs[36];
        let status_detail = bhs[37];
        if status_class != 0 {
            log::warn!("iSCSI login failed ({status_class}.{status_detail})");
            let rc = if status_class == 2 {
                Err(Error::PermissionDenied)
            } else {
                Err(Error::Protocol)
            };
            self.state.lock().login_rc = Some(rc);
            return;
        }

        let keys = parse_text_keys(data);
        let transit = bhs[1] & 0x80 != 0;
        let nsg = bhs[1] & 0x03;

        let mut state = self.state.lock();
        state.exp_stat_sn = u32::from_be_bytes([bhs[24], bhs[25], bhs[26], bhs[27]])
            .wrapping_add(1);
        if let Some(dsl) = lookup(&keys, "MaxRecvDataSegmentLength") {
            if let Ok(dsl) = dsl.parse::<usize>() {
                state.target_max_dsl = dsl.clamp(512, 1 << 20);
            }
        }

        match state.phase {
            Phase::SecurityNegotiation => {
                // A challenge from the target gets answered immediately
                if let (Some(id_text), Some(challenge_text)) =
                    (lookup(&keys, "CHAP_I"), lookup(&keys, "CHAP_C"))
                {
                    let Some((user, secret)) = self.params.chap.clone() else {
                        state.login_rc = Some(Err(Error::PermissionDenied));
                        return;
                    };
                    let response = match chap_response(&secret, id_text, challenge_text) {
                        Some(response) => response,
                        None => {
                            state.login_rc = Some(Err(Error::Protocol));
                            return;
                        }
                    };
                    let mut reply: KeyList = Vec::new();
                    reply.push(("CHAP_N".into(), user));
                    reply.push(("CHAP_R".into(), response));
                    state.chap_reply = Some(reply);
                    state.chap_stage = 2;
                    drop(state);
                    let _ = self.send_login_request();
                    return;
                }
                // Authentication accepted: move to operational keys
                if transit && nsg == 1 {
                    state.phase = Phase::OperationalNegotiation;
                    drop(state);
                    let _ = self.send_login_request();
                    return;
                }
                // AuthMethod settled: offer the MD5 CHAP algorithm
                if state.chap_stage == 0 {
                    state.chap_stage = 1;
                    drop(state);
                    let _ = self.send_login_request();
                    return;
                }
                state.login_rc = Some(Err(Error::Protocol));
            }
            Phase::OperationalNegotiation => {
                if transit && nsg == 3 {
                    state.tsih = u16::from_be_bytes([bhs[14], bhs[15]]);
                    state.phase = Phase::FullFeature;
                    state.login_rc = Some(Ok(()));
                    log::info!("iSCSI session with {} up", self.params.target_name);
                } else {
                    // Target still negotiating; echo our keys again
                    drop(state);
                    let _ = self.send_login_request();
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Full-feature phase
    // ========================================================================

    /// Issue one SCSI command and block until it completes
    fn scsi_command(
        self: &Arc<Self>,
        cdb: &[u8],
        read_len: usize,
        out_data: &[u8],
    ) -> Result<Vec<u8>> {
        for attempt in 0..=MAX_SESSION_RETRIES {
            if attempt > 0 {
                log::debug!("iSCSI session recovery (attempt {attempt})");
                if self.login().is_err() {
                    continue;
                }
            }
            match self.try_scsi_command(cdb, read_len, out_data) {
                Ok(data) => return Ok(data),
                Err(Error::TimedOut) | Err(Error::ConnectionReset) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::TimedOut)
    }

    fn try_scsi_command(
        &self,
        cdb: &[u8],
        read_len: usize,
        out_data: &[u8],
    ) -> Result<Vec<u8>> {
        let itt = {
            let mut state = self.state.lock();
            if state.phase != Phase::FullFeature {
                return Err(Error::ConnectionReset);
            }
            let itt = state.next_itt;
            state.next_itt = state.next_itt.wrapping_add(1);
            state.pending = Some(Pending {
                itt,
                buf: alloc::vec![0u8; read_len],
                out_data: out_data.to_vec(),
                status: None,
            });

            let mut bhs = [0u8; BHS_LEN];
            bhs[0] = OP_SCSI_CMD;
            // Final + direction
            bhs[1] = 0x80
                | if read_len > 0 { 0x40 } else { 0 }
                | if !out_data.is_empty() { 0x20 } else { 0 };
            bhs[8..16].copy_from_slice(&lun_bytes(self.params.lun));
            bhs[16..20].copy_from_slice(&itt.to_be_bytes());
            let edtl = if read_len > 0 { read_len } else { out_data.len() };
            bhs[20..24].copy_from_slice(&(edtl as u32).to_be_bytes());
            bhs[24..28].copy_from_slice(&state.cmd_sn.to_be_bytes());
            bhs[28..32].copy_from_slice(&state.exp_stat_sn.to_be_bytes());
            bhs[32..32 + cdb.len().min(16)].copy_from_slice(&cdb[..cdb.len().min(16)]);
            state.cmd_sn = state.cmd_sn.wrapping_add(1);
            drop(state);

            self.send_pdu(&bhs, &[])?;
            itt
        };

        let done = process::wait_until(
            || {
                self.state
                    .lock()
                    .pending
                    .as_ref()
                    .map(|p| p.status.is_some())
                    .unwrap_or(true)
            },
            Some(SAN_COMMAND_TIMEOUT),
        );
        let mut state = self.state.lock();
        let pending = state.pending.take().ok_or(Error::ConnectionReset)?;
        if !done {
            return Err(Error::TimedOut);
        }
        if pending.itt != itt {
            return Err(Error::Protocol);
        }
        pending.status.unwrap_or(Err(Error::TimedOut))?;
        Ok(pending.buf)
    }

    /// Solicited Data-Out in response to an R2T
    fn send_data_out(&self, ttt: u32, offset: usize, length: usize) {
        let (data, itt, max_dsl, exp_stat_sn) = {
            let state = self.state.lock();
            let Some(pending) = state.pending.as_ref() else {
                return;
            };
            let end = (offset + length).min(pending.out_data.len());
            (
                pending.out_data[offset.min(end)..end].to_vec(),
                pending.itt,
                state.target_max_dsl,
                state.exp_stat_sn,
            )
        };

        let mut data_sn = 0u32;
        let mut chunk_offset = 0usize;
        while chunk_offset < data.len() {
            let chunk = &data[chunk_offset..(chunk_offset + max_dsl).min(data.len())];
            let final_chunk = chunk_offset + chunk.len() >= data.len();

            let mut bhs = [0u8; BHS_LEN];
            bhs[0] = OP_DATA_OUT;
            bhs[1] = if final_chunk { 0x80 } else { 0x00 };
            bhs[5..8].copy_from_slice(&dsl_bytes(chunk.len()));
            bhs[8..16].copy_from_slice(&lun_bytes(self.params.lun));
            bhs[16..20].copy_from_slice(&itt.to_be_bytes());
            bhs[20..24].copy_from_slice(&ttt.to_be_bytes());
            bhs[28..32].copy_from_slice(&exp_stat_sn.to_be_bytes());
            bhs[36..40].copy_from_slice(&data_sn.to_be_bytes());
            bhs[40..44].copy_from_slice(&((offset + chunk_offset) as u32).to_be_bytes());
            let _ = self.send_pdu(&bhs, chunk);

            data_sn += 1;
            chunk_offset += chunk.len();
        }
    }

    /// Process one complete PDU
    fn process_pdu(&self, bhs: &[u8], data: &[u8]) {
        let opcode = bhs[0] & 0x3f;
        match opcode {
            OP_LOGIN_RSP => self.process_login_response(bhs, data),
            OP_DATA_IN => {
                let itt = u32::from_be_bytes([bhs[16], bhs[17], bhs[18], bhs[19]]);
                let offset =
                    u32::from_be_bytes([bhs[40], bhs[41], bhs[42], bhs[43]]) as usize;
                let has_status = bhs[1] & 0x01 != 0;
                let mut state = self.state.lock();
                if has_status {
                    state.exp_stat_sn =
                        u32::from_be_bytes([bhs[24], bhs[25], bhs[26], bhs[27]])
                            .wrapping_add(1);
                }
                if let Some(pending) = state.pending.as_mut() {
                    if pending.itt == itt {
                        let end = (offset + data.len()).min(pending.buf.len());
                        if offset < end {
                            pending.buf[offset..end]
                                .copy_from_slice(&data[..end - offset]);
                        }
                        if has_status {
                            pending.status = Some(Ok(()));
                        }
                    }
                }
            }
            OP_SCSI_RSP => {
                let itt = u32::from_be_bytes([bhs[16], bhs[17], bhs[18], bhs[19]]);
                let response = bhs[2];
                let status = bhs[3];
                let mut state = self.state.lock();
                state.exp_stat_sn = u32::from_be_bytes([bhs[24], bhs[25], bhs[26], bhs[27]])
                    .wrapping_add(1);
                if let Some(pending) = state.pending.as_mut() {
                    if pending.itt == itt {
                        pending.status = Some(if response == 0 && status == 0 {
                            Ok(())
                        } else {
                            log::debug!("iSCSI SCSI status {status:#04x}");
                            Err(Error::Platform(u32::from(status)))
                        });
                    }
                }
            }
            OP_R2T => {
                let ttt = u32::from_be_bytes([bhs[20], bhs[21], bhs[22], bhs[23]]);
                let offset = u32::from_be_bytes([bhs[40], bhs[41], bhs[42], bhs[43]]) as usize;
                let length = u32::from_be_bytes([bhs[44], bhs[45], bhs[46], bhs[47]]) as usize;
                {
                    let mut state = self.state.lock();
                    state.exp_stat_sn =
                        u32::from_be_bytes([bhs[24], bhs[25], bhs[26], bhs[27]]);
                }
                self.send_data_out(ttt, offset, length);
            }
            OP_NOP_IN => {
                // Answer pings that want an answer
                let ttt = u32::from_be_bytes([bhs[20], bhs[21], bhs[22], bhs[23]]);
                if ttt != 0xffff_ffff {
                    let (exp_stat_sn, cmd_sn) = {
                        let mut state = self.state.lock();
                        state.exp_stat_sn =
                            u32::from_be_bytes([bhs[24], bhs[25], bhs[26], bhs[27]])
                                .wrapping_add(1);
                        (state.exp_stat_sn, state.cmd_sn)
                    };
                    let mut reply = [0u8; BHS_LEN];
                    reply[0] = OP_NOP_OUT | IMMEDIATE;
                    reply[1] = 0x80;
                    reply[8..16].copy_from_slice(&lun_bytes(self.params.lun));
                    reply[16..20].copy_from_slice(&0xffff_ffffu32.to_be_bytes());
                    reply[20..24].copy_from_slice(&ttt.to_be_bytes());
                    reply[24..28].copy_from_slice(&cmd_sn.to_be_bytes());
                    reply[28..32].copy_from_slice(&exp_stat_sn.to_be_bytes());
                    let _ = self.send_pdu(&reply, &[]);
                }
            }
            OP_REJECT => {
                log::warn!("iSCSI reject (reason {:#04x})", bhs[2]);
                let mut state = self.state.lock();
                if let Some(pending) = state.pending.as_mut() {
                    pending.status = Some(Err(Error::Protocol));
                }
            }
            _ => {}
        }
    }
}

impl XferTarget for IscsiSession {
    /// TCP stream bytes: reassemble PDUs
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        self.state.lock().rx_buf.extend_from_slice(iobuf.as_ref());
        loop {
            let pdu = {
                let mut state = self.state.lock();
                if state.rx_buf.len() < BHS_LEN {
                    return Ok(());
                }
                let ahs_len = usize::from(state.rx_buf[4]) * 4;
                let dsl = usize::from(state.rx_buf[5]) << 16
                    | usize::from(state.rx_buf[6]) << 8
                    | usize::from(state.rx_buf[7]);
                let padded = dsl.div_ceil(4) * 4;
                let total = BHS_LEN + ahs_len + padded;
                if state.rx_buf.len() < total {
                    return Ok(());
                }
                let pdu: Vec<u8> = state.rx_buf.drain(..total).collect();
                (pdu, ahs_len, dsl)
            };
            let (pdu, ahs_len, dsl) = pdu;
            let bhs = &pdu[..BHS_LEN];
            let data = &pdu[BHS_LEN + ahs_len..BHS_LEN + ahs_len + dsl];
            self.process_pdu(bhs, data);
        }
    }

    fn close(&self, rc: Result<()>) {
        let mut state = self.state.lock();
        log::debug!("iSCSI connection closed");
        state.phase = Phase::Failed;
        if state.login_rc.is_none() {
            state.login_rc = Some(Err(rc.err().unwrap_or(Error::ConnectionReset)));
        }
        if let Some(pending) = state.pending.as_mut() {
            if pending.status.is_none() {
                pending.status = Some(Err(Error::ConnectionReset));
            }
        }
    }
}

impl core::fmt::Debug for IscsiSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IscsiSession")
            .field("target", &self.params.target_name)
            .finish()
    }
}

// ============================================================================
// Block-device face
// ============================================================================

struct IscsiBlock {
    session: Arc<IscsiSession>,
    block_size: Mutex<usize>,
}

impl BlockDevice for IscsiBlock {
    fn read(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let block_size = *self.block_size.lock();
        let mut cdb = [0u8; 16];
        cdb[0] = 0x88; // READ(16)
        cdb[2..10].copy_from_slice(&lba.to_be_bytes());
        cdb[10..14].copy_from_slice(&(count as u32).to_be_bytes());
        let data = self
            .session
            .scsi_command(&cdb, count * block_size, &[])?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(())
    }

    fn write(&self, lba: u64, count: usize, buf: &[u8]) -> Result<()> {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x8a; // WRITE(16)
        cdb[2..10].copy_from_slice(&lba.to_be_bytes());
        cdb[10..14].copy_from_slice(&(count as u32).to_be_bytes());
        self.session.scsi_command(&cdb, 0, buf)?;
        Ok(())
    }

    fn capacity(&self) -> Result<Capacity> {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x9e; // SERVICE ACTION IN(16)
        cdb[1] = 0x10; // READ CAPACITY(16)
        cdb[10..14].copy_from_slice(&32u32.to_be_bytes());
        let data = self.session.scsi_command(&cdb, 32, &[])?;
        if data.len() < 12 {
            return Err(Error::Protocol);
        }
        let last_lba = u64::from_be_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);
        let block_size =
            u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if block_size == 0 {
            return Err(Error::Protocol);
        }
        *self.block_size.lock() = block_size;
        Ok(Capacity {
            block_size,
            blocks: last_lba + 1,
            max_xfer: (MAX_RECV_DSL / block_size).max(1),
        })
    }

    fn reset(&self) -> Result<()> {
        self.session.teardown();
        self.session.login()
    }
}

fn open_iscsi(uri: &Uri) -> Result<Arc<dyn BlockDevice>> {
    let session = IscsiSession::connect(uri)?;
    Ok(Arc::new(IscsiBlock {
        session,
        block_size: Mutex::new(512),
    }))
}

static INIT: spin::Once<()> = spin::Once::new();

pub fn init() {
    INIT.call_once(|| {
        register_san_opener(SanOpener {
            scheme: "iscsi",
            open: open_iscsi,
        });
    });
}

// ============================================================================
// Helpers
// ============================================================================

fn dsl_bytes(len: usize) -> [u8; 3] {
    [(len >> 16) as u8, (len >> 8) as u8, len as u8]
}

/// Single-level LUN encoding
fn lun_bytes(lun: u64) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&(lun as u16).to_be_bytes());
    out
}

/// Parse null-terminated `key=value` pairs
fn parse_text_keys(data: &[u8]) -> Vec<(String, String)> {
    data.split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| {
            let text = String::from_utf8_lossy(chunk);
            let (key, value) = text.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn lookup<'a>(keys: &'a [(String, String)], name: &str) -> Option<&'a str> {
    keys.iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// CHAP response: `MD5(id || secret || challenge)`, hex-encoded
fn chap_response(secret: &str, id_text: &str, challenge_text: &str) -> Option<String> {
    let id: u8 = id_text.trim().parse().ok()?;
    let challenge = decode_chap_value(challenge_text)?;
    let mut md5 = Md5::new();
    md5.update(&[id]);
    md5.update(secret.as_bytes());
    md5.update(&challenge);
    let digest = md5.finalize();
    Some(format!("0x{}", cinder_kernel::hex::encode(&digest, "")))
}

/// CHAP binary values arrive as "0x..." hex or "0b..." base64
fn decode_chap_value(text: &str) -> Option<Vec<u8>> {
    if let Some(hex_text) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        cinder_kernel::hex::decode(hex_text).ok()
    } else if let Some(b64) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        cinder_kernel::base64::decode(b64).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_parsing() {
        let (server, port, lun, target) =
            IscsiSession::parse_root_path("10.0.2.20::::iqn.2020-01.example:target").unwrap();
        assert_eq!(server, "10.0.2.20");
        assert_eq!(port, ISCSI_PORT);
        assert_eq!(lun, 0);
        assert_eq!(target, "iqn.2020-01.example:target");

        let (server, port, lun, target) =
            IscsiSession::parse_root_path("sanhost:6:3266:2:iqn.x:y").unwrap();
        assert_eq!(server, "sanhost");
        assert_eq!(port, 3266);
        assert_eq!(lun, 2);
        assert_eq!(target, "iqn.x:y");

        assert!(IscsiSession::parse_root_path("10.0.2.20").is_err());
    }

    #[test]
    fn text_key_codec() {
        let wire = b"InitiatorName=iqn.a\0TargetName=iqn.b:c\0\0";
        let keys = parse_text_keys(wire);
        assert_eq!(lookup(&keys, "InitiatorName"), Some("iqn.a"));
        assert_eq!(lookup(&keys, "TargetName"), Some("iqn.b:c"));
        assert_eq!(lookup(&keys, "Missing"), None);
    }

    #[test]
    fn chap_response_format() {
        let response = chap_response("secret", "1", "0xdeadbeef").unwrap();
        assert!(response.starts_with("0x"));
        assert_eq!(response.len(), 2 + 32);
        // Same inputs, same response; different challenge, different one
        assert_eq!(response, chap_response("secret", "1", "0xdeadbeef").unwrap());
        assert_ne!(response, chap_response("secret", "1", "0xdeadbeff").unwrap());
    }

    #[test]
    fn dsl_and_lun_encoding() {
        assert_eq!(dsl_bytes(0x012345), [0x01, 0x23, 0x45]);
        assert_eq!(lun_bytes(3)[..2], [0, 3]);
    }
}
