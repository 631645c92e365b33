//! # cinder SAN Layer
//!
//! Adapts network block transports (iSCSI, AoE, SRP) into block devices
//! with drive numbering, per-command timeouts, transparent CD-ROM
//! detection and an iBFT builder so a booted OS can find its own root.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod aoe;
pub mod block;
pub mod device;
pub mod ibft;
pub mod iscsi;
pub mod srp;

pub use block::{BlockDevice, Capacity};
pub use device::{san_hook, san_unhook, SanDevice};

use cinder_kernel::error::{Error, Result};
use cinder_kernel::process;
use cinder_kernel::ticks::TICKS_PER_SEC;

/// Resolve a server name, spinning the scheduler until DNS answers
pub(crate) fn resolve_blocking(name: &str, port: u16) -> Result<core::net::SocketAddr> {
    let resolution = cinder_proto::resolv::resolve(name, port)?;
    let done = process::wait_until(
        || resolution.result().is_some(),
        Some(15 * TICKS_PER_SEC),
    );
    if !done {
        return Err(Error::TimedOut);
    }
    resolution.result().unwrap_or(Err(Error::TimedOut))
}

/// Initialise the SAN transports. Idempotent.
pub fn san_init() {
    iscsi::init();
    aoe::init();
    srp::init();
}
