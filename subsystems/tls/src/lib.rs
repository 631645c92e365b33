//! # cinder TLS 1.2 Client
//!
//! The record layer and client handshake sitting between HTTP and TCP. A
//! TLS connection is a filter in the interface graph: the application
//! delivers plaintext into one side, the TCP connection delivers records
//! into the other, and the handshake state machine in between derives the
//! keys.
//!
//! Supported cipher suites cover the common AES-CBC-SHA and AES-GCM
//! families under RSA, DHE-RSA and ECDHE-RSA key exchange. X.509 chain
//! validation is delegated to a pluggable certificate validator;
//! handshake progress blocks until the validator reports.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod conn;
pub mod prf;
pub mod session;
pub mod suites;
pub mod validator;

use alloc::sync::Arc;
use core::net::SocketAddr;

use cinder_kernel::error::Result;
use cinder_kernel::intf::XferTarget;
use cinder_kernel::open::{register_opener, UriOpener};
use cinder_kernel::uri::Uri;

pub use conn::TlsConnection;
pub use validator::{set_validator, CertificateValidator};

/// HTTPS: the HTTP state machine over a TLS transport
fn tls_factory(
    addr: SocketAddr,
    server_name: &str,
    receiver: Arc<dyn XferTarget>,
) -> Result<Arc<dyn XferTarget>> {
    Ok(TlsConnection::open(addr, server_name, receiver)?)
}

fn open_https(uri: &Uri, receiver: Arc<dyn XferTarget>) -> Result<Arc<dyn XferTarget>> {
    Ok(cinder_proto::http::HttpConnection::open_with(
        uri,
        receiver,
        tls_factory,
        443,
        cinder_proto::http::MAX_REDIRECTS,
    )?)
}

static INIT: spin::Once<()> = spin::Once::new();

/// Register the https opener and the TLS process. Idempotent.
pub fn tls_init() {
    INIT.call_once(|| {
        conn::init();
        register_opener(UriOpener {
            scheme: "https",
            open: open_https,
        });
    });
}
