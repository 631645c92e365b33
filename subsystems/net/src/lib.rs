//! # cinder Network Stack
//!
//! The layered stack between the link drivers and the application
//! protocols:
//!
//! ```text
//! +--------------------------------------------------------+
//! |        UDP            TCP           ICMP/ICMPv6        |
//! +--------------------------------------------------------+
//! |        IPv4 (routes, frag)    IPv6 (routes, SLAAC)     |
//! +--------------------------------------------------------+
//! |        ARP / NDP neighbour cache (deferred TX)         |
//! +--------------------------------------------------------+
//! |        Ethernet link protocol                          |
//! +--------------------------------------------------------+
//! |        Net devices (TX/RX queues, poll, stats)         |
//! +--------------------------------------------------------+
//! ```
//!
//! Each boundary is a table-driven registry: link drivers register net
//! devices, net protocols register by ethertype, transports register by IP
//! protocol number. The scheduler's net-poll process pulls one received
//! buffer per device per pass so drivers keep priority over downstream
//! processing.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

/// Serialises tests that touch crate-global state (device registry,
/// neighbour cache, route tables)
#[cfg(test)]
pub(crate) static TEST_MUTEX: spin::Mutex<()> = spin::Mutex::new(());

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod ndp;
pub mod neighbour;
pub mod netdev;
pub mod tcp;
pub mod tcpip;
pub mod udp;

pub use netdev::{MacAddr, NetDevice, NetDeviceOps};

/// Initialise the stack: registers the net-poll process and the protocol
/// tables. Idempotent.
pub fn net_init() {
    netdev::init();
    arp::init();
    ipv4::init();
    ipv6::init();
    icmp::init();
    ndp::init();
    udp::init();
    tcp::init();
    neighbour::init();
}
