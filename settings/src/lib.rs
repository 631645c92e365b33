//! # cinder Settings Store
//!
//! A hierarchical typed key/value configuration tree. Settings blocks hang
//! off a global root: one block per NIC (backed by the DHCP options learned
//! on that NIC), plus blocks for ProxyDHCP offers, command-line assignments
//! and platform tables. A lookup walks the tree in priority order, so the
//! same tag stored in several blocks resolves to exactly one value.
//!
//! Tags live in the DHCP option namespace, including encapsulated
//! (two-level) options; symbolic names map onto tags through the predefined
//! setting table.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod block;
pub mod dhcpopts;
pub mod tag;
pub mod types;

pub use block::{register_settings, root_settings, unregister_settings, SettingsBlock};
pub use dhcpopts::DhcpOptions;
pub use tag::Tag;
pub use types::{Setting, SettingType};
