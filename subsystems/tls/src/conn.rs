//! # TLS Connection
//!
//! Record framing and the client handshake state machine. The connection
//! is a filter object: the application plugs into one face, the TCP
//! connection into the other. Handshake messages accumulate into a
//! transcript digest; the Finished exchange proves both sides saw the
//! same one.
//!
//! ```text
//!   CLIENT_HELLO -->
//!                          <-- SERVER_HELLO
//!                          <-- CERTIFICATE
//!                          <-- [SERVER_KEY_EXCHANGE]
//!                          <-- [CERTIFICATE_REQUEST]
//!                          <-- SERVER_HELLO_DONE
//!   [CERTIFICATE] -->
//!   CLIENT_KEY_EXCHANGE -->
//!   CHANGE_CIPHER_SPEC -->
//!   FINISHED -->
//!                          <-- CHANGE_CIPHER_SPEC
//!                          <-- FINISHED
//! ```
//!
//! Resumed sessions (matching session ID from the cache) skip the key
//! exchange: the server goes straight to CHANGE_CIPHER_SPEC and both
//! sides reuse the cached master secret.

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::net::SocketAddr;

use spin::{Mutex, RwLock};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::intf::{Intf, XferMeta, XferTarget};
use cinder_kernel::iobuf::IoBuffer;
use cinder_kernel::process::{self, Process};
use cinder_kernel::random;
use cinder_crypto::bignum::BigUint;
use cinder_crypto::digest::Digest;
use cinder_crypto::gcm::AesGcm;
use cinder_crypto::hmac::hmac;
use cinder_crypto::rsa::RsaPublicKey;
use cinder_crypto::sha1::sha1;
use cinder_crypto::sha256::{sha256, Sha256};
use cinder_crypto::{cbc::Cbc, Aes};
use cinder_crypto::{p256, x25519};
use cinder_net::tcp::TcpConnection;

use crate::prf;
use crate::session::{self, Session};
use crate::suites::{self, CipherSuite, KeyExchange};
use crate::validator::{self, ValidationJob};

const TLS_1_2: u16 = 0x0303;

/// Negotiated maximum plaintext fragment
const MAX_FRAGMENT: usize = 4096;

// Record types
const REC_CCS: u8 = 20;
const REC_ALERT: u8 = 21;
const REC_HANDSHAKE: u8 = 22;
const REC_DATA: u8 = 23;

// Handshake types
const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_CERTIFICATE: u8 = 11;
const HS_SERVER_KEY_EXCHANGE: u8 = 12;
const HS_CERTIFICATE_REQUEST: u8 = 13;
const HS_SERVER_HELLO_DONE: u8 = 14;
const HS_CLIENT_KEY_EXCHANGE: u8 = 16;
const HS_FINISHED: u8 = 20;

// Named groups
const GROUP_SECP256R1: u16 = 0x0017;
const GROUP_X25519: u16 = 0x001d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// ClientHello sent, awaiting ServerHello
    Hello,
    /// Collecting the server's first flight
    ServerFlight,
    /// Awaiting CCS + Finished (client flight sent, or resumption)
    AwaitFinished,
    /// Application data flowing
    Active,
    Closed,
}

/// One direction's record protection
enum RecordCipher {
    Null,
    Gcm {
        gcm: AesGcm,
        fixed_iv: [u8; 4],
        seq: u64,
    },
    Cbc {
        key: Vec<u8>,
        mac_key: Vec<u8>,
        seq: u64,
    },
}

/// Key-exchange secrets generated for the client flight
enum KxSecret {
    None,
    X25519([u8; 32]),
    P256([u8; 32]),
    Dhe { x: Vec<u8>, p: Vec<u8>, g: Vec<u8>, ys: Vec<u8> },
}

struct TlsState {
    phase: Phase,
    resumed: bool,
    client_random: [u8; 32],
    server_random: [u8; 32],
    session_id: Vec<u8>,
    offered_session: Option<Session>,
    suite: Option<CipherSuite>,
    /// Running handshake transcript
    transcript: Sha256,
    /// Raw record reassembly
    rx_buf: Vec<u8>,
    /// Handshake message reassembly (messages span records)
    hs_buf: Vec<u8>,
    server_key: Option<RsaPublicKey>,
    kx: KxSecret,
    server_kx_raw: Option<Vec<u8>>,
    cert_requested: bool,
    hello_done: bool,
    validation: Option<Arc<ValidationJob>>,
    flight_sent: bool,
    master_secret: Vec<u8>,
    tx_cipher: RecordCipher,
    rx_cipher: RecordCipher,
    pending_tx: Option<RecordCipher>,
    pending_rx: Option<RecordCipher>,
    /// Plaintext queued until the handshake completes
    app_tx: Vec<u8>,
}

/// A TLS connection (application-facing endpoint)
pub struct TlsConnection {
    /// Application data interface
    pub intf: Intf,
    server_name: String,
    transport: Mutex<Option<Arc<TcpConnection>>>,
    state: Mutex<TlsState>,
}

/// TCP-facing endpoint: records in, close propagation
struct CipherSide {
    conn: Weak<TlsConnection>,
}

impl XferTarget for CipherSide {
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        match self.conn.upgrade() {
            Some(conn) => conn.rx_bytes(iobuf.as_ref()),
            None => Ok(()),
        }
    }

    fn close(&self, rc: Result<()>) {
        if let Some(conn) = self.conn.upgrade() {
            let phase = conn.state.lock().phase;
            let rc = match (phase, rc) {
                (Phase::Active, Ok(())) => Ok(()),
                (_, Ok(())) => Err(Error::ConnectionReset),
                (_, err) => err,
            };
            conn.finish(rc);
        }
    }
}

static CONNECTIONS: RwLock<Vec<Arc<TlsConnection>>> = RwLock::new(Vec::new());

impl TlsConnection {
    /// Open a TLS session to `addr`, with SNI `server_name`, delivering
    /// plaintext into `receiver`
    pub fn open(
        addr: SocketAddr,
        server_name: &str,
        receiver: Arc<dyn XferTarget>,
    ) -> Result<Arc<TlsConnection>> {
        let mut client_random = [0u8; 32];
        random::fill(&mut client_random);
        let offered_session = session::lookup(server_name);

        let conn = Arc::new(TlsConnection {
            intf: Intf::new(),
            server_name: server_name.to_string(),
            transport: Mutex::new(None),
            state: Mutex::new(TlsState {
                phase: Phase::Hello,
                resumed: false,
                client_random,
                server_random: [0; 32],
                session_id: Vec::new(),
                offered_session,
                suite: None,
                transcript: Sha256::new(),
                rx_buf: Vec::new(),
                hs_buf: Vec::new(),
                server_key: None,
                kx: KxSecret::None,
                server_kx_raw: None,
                cert_requested: false,
                hello_done: false,
                validation: None,
                flight_sent: false,
                master_secret: Vec::new(),
                tx_cipher: RecordCipher::Null,
                rx_cipher: RecordCipher::Null,
                pending_tx: None,
                pending_rx: None,
                app_tx: Vec::new(),
            }),
        });
        conn.intf.plug(receiver);

        let cipher_side = Arc::new(CipherSide {
            conn: Arc::downgrade(&conn),
        });
        let tcp = TcpConnection::open(addr, cipher_side)?;
        *conn.transport.lock() = Some(tcp);
        CONNECTIONS.write().push(conn.clone());

        conn.send_client_hello();
        Ok(conn)
    }

    fn finish(&self, rc: Result<()>) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
        }
        if let Some(tcp) = self.transport.lock().take() {
            XferTarget::close(&*tcp, Ok(()));
        }
        CONNECTIONS.write().retain(|c| !core::ptr::eq(&**c, self));
        self.intf.shutdown(rc);
    }

    // ========================================================================
    // Record layer
    // ========================================================================

    /// Protect and transmit one record
    fn tx_record(&self, state: &mut TlsState, rec_type: u8, plaintext: &[u8]) {
        for fragment in plaintext.chunks(MAX_FRAGMENT.max(1)) {
            let payload = match &mut state.tx_cipher {
                RecordCipher::Null => fragment.to_vec(),
                RecordCipher::Gcm { gcm, fixed_iv, seq } => {
                    let explicit = seq.to_be_bytes();
                    let mut nonce = [0u8; 12];
                    nonce[..4].copy_from_slice(fixed_iv);
                    nonce[4..].copy_from_slice(&explicit);
                    let aad = record_aad(*seq, rec_type, fragment.len());
                    let mut data = fragment.to_vec();
                    let tag = gcm.encrypt(&nonce, &aad, &mut data);
                    *seq += 1;
                    let mut out = explicit.to_vec();
                    out.extend_from_slice(&data);
                    out.extend_from_slice(&tag);
                    out
                }
                RecordCipher::Cbc { key, mac_key, seq } => {
                    let mac = hmac(sha1, mac_key, &{
                        let mut m = record_aad(*seq, rec_type, fragment.len()).to_vec();
                        m.extend_from_slice(fragment);
                        m
                    });
                    *seq += 1;
                    let mut iv = [0u8; 16];
                    random::fill(&mut iv);
                    let mut block = fragment.to_vec();
                    block.extend_from_slice(&mac);
                    // TLS padding: N bytes of value N-1
                    let pad = 16 - (block.len() % 16);
                    block.extend(core::iter::repeat((pad - 1) as u8).take(pad));
                    if let Ok(aes) = Aes::new(key) {
                        if let Ok(mut cbc) = Cbc::new(aes, &iv) {
                            let _ = cbc.encrypt(&mut block);
                        }
                    }
                    let mut out = iv.to_vec();
                    out.extend_from_slice(&block);
                    out
                }
            };

            let mut record = Vec::with_capacity(5 + payload.len());
            record.push(rec_type);
            record.extend_from_slice(&TLS_1_2.to_be_bytes());
            record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            record.extend_from_slice(&payload);

            if let Some(tcp) = self.transport.lock().clone() {
                let _ = tcp.deliver(IoBuffer::from_slice(&record), &XferMeta::default());
            }
        }
    }

    /// Unprotect one record's payload
    fn unprotect(
        state: &mut TlsState,
        rec_type: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        match &mut state.rx_cipher {
            RecordCipher::Null => Ok(payload.to_vec()),
            RecordCipher::Gcm { gcm, fixed_iv, seq } => {
                if payload.len() < 8 + 16 {
                    return Err(Error::Protocol);
                }
                let mut nonce = [0u8; 12];
                nonce[..4].copy_from_slice(fixed_iv);
                nonce[4..].copy_from_slice(&payload[..8]);
                let plaintext_len = payload.len() - 8 - 16;
                let aad = record_aad(*seq, rec_type, plaintext_len);
                let mut data = payload[8..8 + plaintext_len].to_vec();
                let tag = &payload[8 + plaintext_len..];
                gcm.decrypt(&nonce, &aad, &mut data, tag)
                    .map_err(|_| Error::PermissionDenied)?;
                *seq += 1;
                Ok(data)
            }
            RecordCipher::Cbc { key, mac_key, seq } => {
                if payload.len() < 16 + 16 || payload.len() % 16 != 0 {
                    return Err(Error::Protocol);
                }
                let iv = &payload[..16];
                let mut data = payload[16..].to_vec();
                let aes = Aes::new(key).map_err(|_| Error::Protocol)?;
                let mut cbc = Cbc::new(aes, iv).map_err(|_| Error::Protocol)?;
                cbc.decrypt(&mut data).map_err(|_| Error::Protocol)?;
                // Strip padding then the MAC
                let pad = usize::from(*data.last().ok_or(Error::Protocol)?);
                if pad + 1 + 20 > data.len() {
                    return Err(Error::PermissionDenied);
                }
                data.truncate(data.len() - pad - 1);
                let mac_offset = data.len() - 20;
                let mac = data.split_off(mac_offset);
                let expected = hmac(sha1, mac_key, &{
                    let mut m = record_aad(*seq, rec_type, data.len()).to_vec();
                    m.extend_from_slice(&data);
                    m
                });
                if mac != expected {
                    return Err(Error::PermissionDenied);
                }
                *seq += 1;
                Ok(data)
            }
        }
    }

    /// Bytes arrived from TCP: reassemble records and dispatch
    fn rx_bytes(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        self.state.lock().rx_buf.extend_from_slice(bytes);
        loop {
            let record = {
                let mut state = self.state.lock();
                if state.phase == Phase::Closed || state.rx_buf.len() < 5 {
                    return Ok(());
                }
                let rec_type = state.rx_buf[0];
                let length = usize::from(u16::from_be_bytes([state.rx_buf[3], state.rx_buf[4]]));
                if state.rx_buf.len() < 5 + length {
                    return Ok(());
                }
                let payload: Vec<u8> = state.rx_buf.drain(..5 + length).skip(5).collect();
                match Self::unprotect(&mut state, rec_type, &payload) {
                    Ok(plaintext) => (rec_type, plaintext),
                    Err(err) => {
                        drop(state);
                        log::debug!("TLS record unprotect failed: {err}");
                        self.finish(Err(err));
                        return Ok(());
                    }
                }
            };

            let (rec_type, plaintext) = record;
            match rec_type {
                REC_CCS => {
                    let mut state = self.state.lock();
                    if let Some(pending) = state.pending_rx.take() {
                        state.rx_cipher = pending;
                    }
                }
                REC_ALERT => {
                    if plaintext.len() >= 2 && plaintext[1] == 0 {
                        // close_notify: orderly end of stream
                        self.finish(Ok(()));
                    } else if plaintext.first() == Some(&2) {
                        log::debug!("TLS fatal alert {}", plaintext.get(1).copied().unwrap_or(0));
                        self.finish(Err(Error::PermissionDenied));
                    }
                }
                REC_HANDSHAKE => {
                    self.state.lock().hs_buf.extend_from_slice(&plaintext);
                    self.process_handshake_messages();
                }
                REC_DATA => {
                    let _ = self
                        .intf
                        .deliver(IoBuffer::from_slice(&plaintext), &XferMeta::default());
                }
                _ => {}
            }
            let closed = self.state.lock().phase == Phase::Closed;
            if closed {
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Handshake transmit
    // ========================================================================

    /// Frame a handshake message, adding it to the transcript
    fn tx_handshake(&self, state: &mut TlsState, msg_type: u8, body: &[u8]) {
        let mut msg = Vec::with_capacity(4 + body.len());
        msg.push(msg_type);
        msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        msg.extend_from_slice(body);
        state.transcript.update(&msg);
        self.tx_record(state, REC_HANDSHAKE, &msg);
    }

    fn send_client_hello(&self) {
        let mut state = self.state.lock();
        let mut body = Vec::new();
        body.extend_from_slice(&TLS_1_2.to_be_bytes());
        body.extend_from_slice(&state.client_random);
        // Offer a cached session for resumption
        let session_id = state
            .offered_session
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_default();
        body.push(session_id.len() as u8);
        body.extend_from_slice(&session_id);
        // Cipher suites
        body.extend_from_slice(&((suites::SUITES.len() * 2) as u16).to_be_bytes());
        for suite in suites::SUITES {
            body.extend_from_slice(&suite.id.to_be_bytes());
        }
        // Null compression only
        body.extend_from_slice(&[1, 0]);

        // Extensions
        let mut ext = Vec::new();
        // SNI
        let host = self.server_name.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        sni.push(0); // host_name
        sni.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni.extend_from_slice(host);
        push_extension(&mut ext, 0x0000, &sni);
        // Max fragment length: 2^12
        push_extension(&mut ext, 0x0001, &[4]);
        // Supported groups
        push_extension(
            &mut ext,
            0x000a,
            &{
                let mut groups = Vec::new();
                groups.extend_from_slice(&4u16.to_be_bytes());
                groups.extend_from_slice(&GROUP_X25519.to_be_bytes());
                groups.extend_from_slice(&GROUP_SECP256R1.to_be_bytes());
                groups
            },
        );
        // EC point formats: uncompressed
        push_extension(&mut ext, 0x000b, &[1, 0]);
        // Signature algorithms: rsa_pkcs1_sha256, rsa_pkcs1_sha1
        push_extension(&mut ext, 0x000d, &[0, 4, 0x04, 0x01, 0x02, 0x01]);
        // Renegotiation info (empty)
        push_extension(&mut ext, 0xff01, &[0]);

        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        log::debug!("TLS ClientHello to {}", self.server_name);
        self.tx_handshake(&mut state, HS_CLIENT_HELLO, &body);
    }

    /// Derive the key block and stage the pending ciphers
    fn derive_keys(&self, state: &mut TlsState) -> Result<()> {
        let suite = state.suite.ok_or(Error::Protocol)?;
        let block = prf::key_block(
            suite.prf_digest(),
            &state.master_secret,
            &state.client_random,
            &state.server_random,
            suite.key_block_len(),
        );
        let mac_len = suite.bulk.mac_len();
        let key_len = suite.bulk.key_len();
        let iv_len = suite.bulk.fixed_iv_len();
        let mut offset = 0;
        let mut take = |n: usize| {
            let part = block[offset..offset + n].to_vec();
            offset += n;
            part
        };
        let client_mac = take(mac_len);
        let server_mac = take(mac_len);
        let client_key = take(key_len);
        let server_key = take(key_len);
        let client_iv = take(iv_len);
        let server_iv = take(iv_len);

        let make = |key: &[u8], mac: &[u8], iv: &[u8]| -> Result<RecordCipher> {
            Ok(if suite.bulk.is_aead() {
                let mut fixed_iv = [0u8; 4];
                fixed_iv.copy_from_slice(iv);
                RecordCipher::Gcm {
                    gcm: AesGcm::new(key)?,
                    fixed_iv,
                    seq: 0,
                }
            } else {
                RecordCipher::Cbc {
                    key: key.to_vec(),
                    mac_key: mac.to_vec(),
                    seq: 0,
                }
            })
        };
        state.pending_tx = Some(make(&client_key, &client_mac, &client_iv)?);
        state.pending_rx = Some(make(&server_key, &server_mac, &server_iv)?);
        Ok(())
    }

    /// Send the client second flight once the server flight is complete
    /// and validation has passed
    fn send_client_flight(&self) {
        let mut state = self.state.lock();
        if state.flight_sent || !state.hello_done {
            return;
        }
        match state.validation.as_ref().and_then(|v| v.result()) {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                drop(state);
                self.finish(Err(err));
                return;
            }
            None => return,
        }
        state.flight_sent = true;

        // Empty certificate if one was requested
        if state.cert_requested {
            self.tx_handshake(&mut state, HS_CERTIFICATE, &[0, 0, 0]);
        }

        // ClientKeyExchange + premaster secret
        let suite = match state.suite {
            Some(suite) => suite,
            None => {
                drop(state);
                self.finish(Err(Error::Protocol));
                return;
            }
        };
        let (cke_body, premaster): (Vec<u8>, Vec<u8>) = match suite.kx {
            KeyExchange::Rsa => {
                let mut premaster = alloc::vec![0u8; 48];
                premaster[0..2].copy_from_slice(&TLS_1_2.to_be_bytes());
                random::fill(&mut premaster[2..]);
                let Some(server_key) = &state.server_key else {
                    drop(state);
                    self.finish(Err(Error::Protocol));
                    return;
                };
                match server_key.encrypt(&premaster) {
                    Ok(encrypted) => {
                        let mut body = (encrypted.len() as u16).to_be_bytes().to_vec();
                        body.extend_from_slice(&encrypted);
                        (body, premaster)
                    }
                    Err(err) => {
                        drop(state);
                        self.finish(Err(err));
                        return;
                    }
                }
            }
            KeyExchange::EcdheRsa | KeyExchange::DheRsa => {
                match core::mem::replace(&mut state.kx, KxSecret::None) {
                    KxSecret::X25519(scalar) => {
                        let our_pub = x25519::public_key(&scalar);
                        let Some(peer) = state.server_kx_raw.take() else {
                            drop(state);
                            self.finish(Err(Error::Protocol));
                            return;
                        };
                        let mut peer32 = [0u8; 32];
                        peer32.copy_from_slice(&peer[..32]);
                        let shared = x25519::x25519(&scalar, &peer32);
                        let mut body = alloc::vec![32u8];
                        body.extend_from_slice(&our_pub);
                        (body, shared.to_vec())
                    }
                    KxSecret::P256(scalar) => {
                        let Some(peer) = state.server_kx_raw.take() else {
                            drop(state);
                            self.finish(Err(Error::Protocol));
                            return;
                        };
                        match (p256::public_key(&scalar), p256::shared_secret(&scalar, &peer)) {
                            (Ok(our_pub), Ok(shared)) => {
                                let mut body = alloc::vec![65u8];
                                body.extend_from_slice(&our_pub);
                                (body, shared.to_vec())
                            }
                            _ => {
                                drop(state);
                                self.finish(Err(Error::Protocol));
                                return;
                            }
                        }
                    }
                    KxSecret::Dhe { x, p, g, ys } => {
                        let p = BigUint::from_bytes_be(&p);
                        let g = BigUint::from_bytes_be(&g);
                        let ys = BigUint::from_bytes_be(&ys);
                        let x = BigUint::from_bytes_be(&x);
                        let yc = g.mod_pow(&x, &p);
                        let shared = ys.mod_pow(&x, &p).to_bytes_be_minimal();
                        let yc_bytes = yc.to_bytes_be_minimal();
                        let mut body = (yc_bytes.len() as u16).to_be_bytes().to_vec();
                        body.extend_from_slice(&yc_bytes);
                        (body, shared)
                    }
                    KxSecret::None => {
                        drop(state);
                        self.finish(Err(Error::Protocol));
                        return;
                    }
                }
            }
        };
        self.tx_handshake(&mut state, HS_CLIENT_KEY_EXCHANGE, &cke_body);

        // Master secret + keys
        state.master_secret = prf::master_secret(
            suite.prf_digest(),
            &premaster,
            &state.client_random,
            &state.server_random,
        );
        if let Err(err) = self.derive_keys(&mut state) {
            drop(state);
            self.finish(Err(err));
            return;
        }

        // ChangeCipherSpec, then Finished under the new keys
        self.tx_record(&mut state, REC_CCS, &[1]);
        if let Some(pending) = state.pending_tx.take() {
            state.tx_cipher = pending;
        }
        let verify = self.finished_verify_data(&state, b"client finished");
        self.tx_handshake(&mut state, HS_FINISHED, &verify);
        state.phase = Phase::AwaitFinished;
        log::debug!("TLS client flight sent ({})", suite.name);
    }

    /// PRF over the current transcript snapshot
    fn finished_verify_data(&self, state: &TlsState, label: &[u8]) -> Vec<u8> {
        let mut transcript = state.transcript.clone();
        let hash = Digest::finalize(&mut transcript);
        prf::prf(sha256, &state.master_secret, label, &hash, 12)
    }

    // ========================================================================
    // Handshake receive
    // ========================================================================

    fn process_handshake_messages(self: &Arc<Self>) {
        loop {
            let message = {
                let mut state = self.state.lock();
                if state.hs_buf.len() < 4 {
                    return;
                }
                let msg_type = state.hs_buf[0];
                let length = usize::from(state.hs_buf[1]) << 16
                    | usize::from(state.hs_buf[2]) << 8
                    | usize::from(state.hs_buf[3]);
                if state.hs_buf.len() < 4 + length {
                    return;
                }
                let raw: Vec<u8> = state.hs_buf.drain(..4 + length).collect();
                // Finished is excluded from its own expected transcript;
                // everything else hashes in immediately
                if msg_type != HS_FINISHED {
                    state.transcript.update(&raw);
                }
                (msg_type, raw)
            };

            let (msg_type, raw) = message;
            let body = &raw[4..];
            let rc = match msg_type {
                HS_SERVER_HELLO => self.on_server_hello(body),
                HS_CERTIFICATE => self.on_certificate(body),
                HS_SERVER_KEY_EXCHANGE => self.on_server_key_exchange(body),
                HS_CERTIFICATE_REQUEST => {
                    self.state.lock().cert_requested = true;
                    Ok(())
                }
                HS_SERVER_HELLO_DONE => {
                    self.state.lock().hello_done = true;
                    self.send_client_flight();
                    Ok(())
                }
                HS_FINISHED => self.on_finished(body, &raw),
                _ => Ok(()),
            };
            if let Err(err) = rc {
                self.finish(Err(err));
                return;
            }
            if self.state.lock().phase == Phase::Closed {
                return;
            }
        }
    }

    fn on_server_hello(&self, body: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if body.len() < 38 {
            return Err(Error::Protocol);
        }
        let version = u16::from_be_bytes([body[0], body[1]]);
        if version != TLS_1_2 {
            return Err(Error::NotSupported);
        }
        state.server_random.copy_from_slice(&body[2..34]);
        let sid_len = usize::from(body[34]);
        let sid = body.get(35..35 + sid_len).ok_or(Error::Protocol)?.to_vec();
        let suite_id = u16::from_be_bytes([
            *body.get(35 + sid_len).ok_or(Error::Protocol)?,
            *body.get(36 + sid_len).ok_or(Error::Protocol)?,
        ]);
        let suite = suites::find_suite(suite_id).ok_or(Error::NotSupported)?;
        state.suite = Some(suite);
        state.session_id = sid.clone();
        log::debug!("TLS ServerHello: {}", suite.name);

        // Resumption: the server echoed our cached session ID
        let resumed_secret = state.offered_session.as_ref().and_then(|cached| {
            if !sid.is_empty() && cached.session_id == sid && cached.suite_id == suite_id {
                Some(cached.master_secret.clone())
            } else {
                None
            }
        });
        if let Some(master_secret) = resumed_secret {
            log::debug!("TLS session resumed");
            state.resumed = true;
            state.master_secret = master_secret;
            self.derive_keys(&mut state)?;
            state.phase = Phase::AwaitFinished;
            return Ok(());
        }
        state.phase = Phase::ServerFlight;
        Ok(())
    }

    fn on_certificate(&self, body: &[u8]) -> Result<()> {
        if body.len() < 3 {
            return Err(Error::Protocol);
        }
        let total = usize::from(body[0]) << 16 | usize::from(body[1]) << 8 | usize::from(body[2]);
        let mut chain = Vec::new();
        let mut rest = body.get(3..3 + total).ok_or(Error::Protocol)?;
        while rest.len() >= 3 {
            let len = usize::from(rest[0]) << 16 | usize::from(rest[1]) << 8 | usize::from(rest[2]);
            let cert = rest.get(3..3 + len).ok_or(Error::Protocol)?;
            chain.push(cert.to_vec());
            rest = &rest[3 + len..];
        }
        if chain.is_empty() {
            return Err(Error::Protocol);
        }

        let server_key = validator::extract_public_key(&chain[0])?;
        let job = validator::validate(&chain, &self.server_name);
        let mut state = self.state.lock();
        state.server_key = Some(server_key);
        state.validation = Some(job);
        Ok(())
    }

    fn on_server_key_exchange(&self, body: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let suite = state.suite.ok_or(Error::Protocol)?;
        match suite.kx {
            KeyExchange::EcdheRsa => {
                // curve_type(1) named_curve(2) pubkey_len(1) pubkey
                if body.len() < 4 || body[0] != 3 {
                    return Err(Error::Protocol);
                }
                let group = u16::from_be_bytes([body[1], body[2]]);
                let key_len = usize::from(body[3]);
                let server_pub = body.get(4..4 + key_len).ok_or(Error::Protocol)?;
                let params_end = 4 + key_len;

                let mut scalar = [0u8; 32];
                random::fill(&mut scalar);
                match group {
                    GROUP_X25519 if key_len == 32 => {
                        state.kx = KxSecret::X25519(scalar);
                    }
                    GROUP_SECP256R1 if key_len == 65 => {
                        state.kx = KxSecret::P256(scalar);
                    }
                    _ => return Err(Error::NotSupported),
                }
                state.server_kx_raw = Some(server_pub.to_vec());
                self.verify_kx_signature(&state, &body[..params_end], &body[params_end..])
            }
            KeyExchange::DheRsa => {
                let (p, rest) = read_vec16(body)?;
                let (g, rest) = read_vec16(rest)?;
                let (ys, rest) = read_vec16(rest)?;
                let params_len = body.len() - rest.len();
                let mut x = alloc::vec![0u8; 32];
                random::fill(&mut x);
                state.kx = KxSecret::Dhe {
                    x,
                    p: p.to_vec(),
                    g: g.to_vec(),
                    ys: ys.to_vec(),
                };
                self.verify_kx_signature(&state, &body[..params_len], rest)
            }
            KeyExchange::Rsa => Err(Error::Protocol),
        }
    }

    /// Verify the server's signature over its key-exchange parameters
    fn verify_kx_signature(&self, state: &TlsState, params: &[u8], sig: &[u8]) -> Result<()> {
        // hash_alg(1) sig_alg(1) sig_len(2) signature
        if sig.len() < 4 {
            return Err(Error::Protocol);
        }
        let hash_alg = sig[0];
        if sig[1] != 1 {
            // Only RSA signatures
            return Err(Error::NotSupported);
        }
        let sig_len = usize::from(u16::from_be_bytes([sig[2], sig[3]]));
        let signature = sig.get(4..4 + sig_len).ok_or(Error::Protocol)?;

        let mut signed = Vec::with_capacity(64 + params.len());
        signed.extend_from_slice(&state.client_random);
        signed.extend_from_slice(&state.server_random);
        signed.extend_from_slice(params);

        let server_key = state.server_key.as_ref().ok_or(Error::Protocol)?;
        let ctor = match hash_alg {
            2 => sha1,
            4 => sha256,
            _ => return Err(Error::NotSupported),
        };
        server_key.verify(ctor, &signed, signature)
    }

    fn on_finished(&self, body: &[u8], raw: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let expected = self.finished_verify_data(&state, b"server finished");
        if body != expected.as_slice() {
            log::debug!("TLS server Finished mismatch");
            return Err(Error::PermissionDenied);
        }
        state.transcript.update(raw);

        if state.resumed {
            // Resumption: our CCS + Finished follow the server's
            self.tx_record(&mut state, REC_CCS, &[1]);
            if let Some(pending) = state.pending_tx.take() {
                state.tx_cipher = pending;
            }
            let verify = self.finished_verify_data(&state, b"client finished");
            self.tx_handshake(&mut state, HS_FINISHED, &verify);
        }

        state.phase = Phase::Active;
        let suite_id = state.suite.map(|s| s.id).unwrap_or(0);
        session::store(
            &self.server_name,
            Session {
                session_id: state.session_id.clone(),
                master_secret: state.master_secret.clone(),
                suite_id,
            },
        );
        log::info!("TLS session with {} established", self.server_name);

        // Flush plaintext queued during the handshake
        let queued = core::mem::take(&mut state.app_tx);
        if !queued.is_empty() {
            self.tx_record(&mut state, REC_DATA, &queued);
        }
        Ok(())
    }

    fn step(&self) {
        // Validation may complete asynchronously; retry the client flight
        let waiting = {
            let state = self.state.lock();
            state.hello_done && !state.flight_sent
        };
        if waiting {
            self.send_client_flight();
        }
    }
}

impl XferTarget for TlsConnection {
    /// Plaintext from the application
    fn deliver(&self, iobuf: IoBuffer, _meta: &XferMeta) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Closed => Err(Error::Cancelled),
            Phase::Active => {
                self.tx_record(&mut state, REC_DATA, iobuf.as_ref());
                Ok(())
            }
            _ => {
                state.app_tx.extend_from_slice(iobuf.as_ref());
                Ok(())
            }
        }
    }

    fn window(&self) -> usize {
        match self.transport.lock().as_ref() {
            Some(tcp) => tcp.window(),
            None => 0,
        }
    }

    fn close(&self, rc: Result<()>) {
        // Send a close_notify alert on a graceful application close
        if rc.is_ok() {
            let mut state = self.state.lock();
            if state.phase == Phase::Active {
                self.tx_record(&mut state, REC_ALERT, &[1, 0]);
            }
        }
        self.finish(rc);
    }
}

impl core::fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsConnection")
            .field("server", &self.server_name)
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}

fn push_extension(out: &mut Vec<u8>, ext_type: u16, body: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

/// The additional data both MAC and AEAD protect:
/// `seq(8) || type || version(2) || length(2)`
fn record_aad(seq: u64, rec_type: u8, len: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = rec_type;
    aad[9..11].copy_from_slice(&TLS_1_2.to_be_bytes());
    aad[11..13].copy_from_slice(&(len as u16).to_be_bytes());
    aad
}

/// Read a 16-bit-length-prefixed vector
fn read_vec16(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < 2 {
        return Err(Error::Protocol);
    }
    let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let body = data.get(2..2 + len).ok_or(Error::Protocol)?;
    Ok((body, &data[2 + len..]))
}

struct TlsProcess;

impl Process for TlsProcess {
    fn name(&self) -> &str {
        "tls"
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
        process::register_process(Arc::new(TlsProcess));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_aad_layout() {
        let aad = record_aad(7, REC_DATA, 256);
        assert_eq!(&aad[..8], &7u64.to_be_bytes());
        assert_eq!(aad[8], REC_DATA);
        assert_eq!(&aad[9..11], &[0x03, 0x03]);
        assert_eq!(&aad[11..13], &[0x01, 0x00]);
    }

    #[test]
    fn gcm_record_round_trip() {
        // Mirror one direction's cipher on both sides
        let key = [0x42u8; 16];
        let fixed_iv = [1, 2, 3, 4];
        let mut tx = RecordCipher::Gcm {
            gcm: AesGcm::new(&key).unwrap(),
            fixed_iv,
            seq: 0,
        };
        let mut rx = RecordCipher::Gcm {
            gcm: AesGcm::new(&key).unwrap(),
            fixed_iv,
            seq: 0,
        };

        let plaintext = b"GET / HTTP/1.1\r\n";
        // Protect
        let protected = {
            let RecordCipher::Gcm { gcm, fixed_iv, seq } = &mut tx else {
                unreachable!()
            };
            let explicit = seq.to_be_bytes();
            let mut nonce = [0u8; 12];
            nonce[..4].copy_from_slice(fixed_iv);
            nonce[4..].copy_from_slice(&explicit);
            let aad = record_aad(*seq, REC_DATA, plaintext.len());
            let mut data = plaintext.to_vec();
            let tag = gcm.encrypt(&nonce, &aad, &mut data);
            *seq += 1;
            let mut out = explicit.to_vec();
            out.extend_from_slice(&data);
            out.extend_from_slice(&tag);
            out
        };

        // Unprotect via the connection's path
        let mut state_stub = stub_state();
        state_stub.rx_cipher = rx;
        let recovered =
            TlsConnection::unprotect(&mut state_stub, REC_DATA, &protected).unwrap();
        assert_eq!(recovered, plaintext);
        rx = core::mem::replace(&mut state_stub.rx_cipher, RecordCipher::Null);
        let RecordCipher::Gcm { seq, .. } = rx else {
            unreachable!()
        };
        assert_eq!(seq, 1);
    }

    #[test]
    fn cbc_record_round_trip() {
        let key = alloc::vec![0x24u8; 16];
        let mac_key = alloc::vec![0x42u8; 20];

        // Protect by hand (mirroring tx_record's CBC arm)
        let plaintext = b"chunky payload";
        let seq = 0u64;
        let mac = hmac(sha1, &mac_key, &{
            let mut m = record_aad(seq, REC_DATA, plaintext.len()).to_vec();
            m.extend_from_slice(plaintext);
            m
        });
        let iv = [9u8; 16];
        let mut block = plaintext.to_vec();
        block.extend_from_slice(&mac);
        let pad = 16 - (block.len() % 16);
        block.extend(core::iter::repeat((pad - 1) as u8).take(pad));
        let mut cbc = Cbc::new(Aes::new(&key).unwrap(), &iv).unwrap();
        cbc.encrypt(&mut block).unwrap();
        let mut protected = iv.to_vec();
        protected.extend_from_slice(&block);

        let mut state_stub = stub_state();
        state_stub.rx_cipher = RecordCipher::Cbc {
            key,
            mac_key,
            seq: 0,
        };
        let recovered =
            TlsConnection::unprotect(&mut state_stub, REC_DATA, &protected).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn tampered_record_rejected() {
        let key = [0x42u8; 16];
        let mut state_stub = stub_state();
        state_stub.rx_cipher = RecordCipher::Gcm {
            gcm: AesGcm::new(&key).unwrap(),
            fixed_iv: [0; 4],
            seq: 0,
        };
        let garbage = [0u8; 40];
        assert!(TlsConnection::unprotect(&mut state_stub, REC_DATA, &garbage).is_err());
    }

    fn stub_state() -> TlsState {
        TlsState {
            phase: Phase::Hello,
            resumed: false,
            client_random: [0; 32],
            server_random: [0; 32],
            session_id: Vec::new(),
            offered_session: None,
            suite: None,
            transcript: Sha256::new(),
            rx_buf: Vec::new(),
            hs_buf: Vec::new(),
            server_key: None,
            kx: KxSecret::None,
            server_kx_raw: None,
            cert_requested: false,
            hello_done: false,
            validation: None,
            flight_sent: false,
            master_secret: Vec::new(),
            tx_cipher: RecordCipher::Null,
            rx_cipher: RecordCipher::Null,
            pending_tx: None,
            pending_rx: None,
            app_tx: Vec::new(),
        }
    }

    #[test]
    fn client_hello_structure() {
        // Build the hello body through a throwaway connection state and
        // check the critical fields parse back
        let mut body = Vec::new();
        body.extend_from_slice(&TLS_1_2.to_be_bytes());
        body.extend_from_slice(&[7u8; 32]);
        body.push(0);
        body.extend_from_slice(&((suites::SUITES.len() * 2) as u16).to_be_bytes());
        for suite in suites::SUITES {
            body.extend_from_slice(&suite.id.to_be_bytes());
        }
        body.extend_from_slice(&[1, 0]);

        assert_eq!(u16::from_be_bytes([body[0], body[1]]), TLS_1_2);
        let suite_count = u16::from_be_bytes([body[35], body[36]]) as usize / 2;
        assert_eq!(suite_count, suites::SUITES.len());
        // The preferred suite is the GCM/ECDHE one named in the boot
        // scenarios
        assert_eq!(
            u16::from_be_bytes([body[37], body[38]]),
            0xc02f
        );
    }
}
