//! # cinder Application Protocols
//!
//! The protocols a network boot actually exercises: DHCPv4 to obtain
//! addressing and boot parameters, DNS to resolve boot-server names, TFTP
//! and HTTP(S) to fetch images, FTP for the stragglers, and AWS SigV4
//! request signing for cloud-hosted boot artifacts.
//!
//! Every protocol here is an explicit state machine advanced by scheduler
//! steps and retry timers; none of them block.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

/// Serialises tests that touch crate-global state
#[cfg(test)]
pub(crate) static TEST_MUTEX: spin::Mutex<()> = spin::Mutex::new(());

pub mod aws;
pub mod dhcp;
pub mod dns;
pub mod ftp;
pub mod http;
pub mod resolv;
pub mod tftp;

/// Initialise: registers processes, transports and URI openers. Idempotent.
pub fn proto_init() {
    cinder_net::net_init();
    dhcp::init();
    dns::init();
    tftp::init();
    http::init();
    ftp::init();
}
