//! # cinder Shell
//!
//! The command interpreter and the `#!ipxe`-style boot script image type.
//! Commands print errors as a single `"<cmd>: <message> (<hex code>)"`
//! line and leave their status in `$?`; `&&` and `||` short-circuit the
//! way a shell user expects.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

/// Serialises tests that touch crate-global state
#[cfg(test)]
pub(crate) static TEST_MUTEX: spin::Mutex<()> = spin::Mutex::new(());

pub mod commands;
pub mod parse;
pub mod script;

pub use commands::{execute_line, last_status, register_command, set_boot_handler, Command};

static INIT: spin::Once<()> = spin::Once::new();

/// Initialise the whole firmware stack plus the shell. Idempotent.
pub fn shell_init() {
    INIT.call_once(|| {
        cinder_proto::proto_init();
        cinder_tls::tls_init();
        cinder_san::san_init();
        cinder_image::image_init();
        commands::register_builtins();
        script::init();
    });
}
