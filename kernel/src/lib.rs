//! # cinder Object Kernel
//!
//! The cooperative asynchronous kernel underneath the cinder network boot
//! firmware. Every long-running operation in the system - a DNS lookup, a TCP
//! stream, an iSCSI session - is a graph of reference-counted objects joined
//! by typed bidirectional interfaces, advanced by a single-threaded
//! round-robin scheduler.
//!
//! ## Design Philosophy
//!
//! - **No preemption**: any run of code between scheduler steps is atomic.
//!   Locks here are interior-mutability plumbing, never contended.
//! - **No blocking**: processes return quickly and are stepped again on the
//!   next pass. Waiting is expressed with retry timers and interface closes.
//! - **Deterministic teardown**: shutting down an interface cascades `close`
//!   through the object graph and unwinds reference counts without
//!   allocating.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod base64;
pub mod console;
pub mod discard;
pub mod error;
pub mod hex;
pub mod intf;
pub mod iobuf;
pub mod job;
pub mod open;
pub mod process;
pub mod random;
pub mod retry;
pub mod ticks;
pub mod uri;

pub use error::{Error, Result};
pub use intf::{plug_pair, Intf, XferMeta, XferTarget};
pub use iobuf::IoBuffer;
pub use job::{JobProgress, JobTarget, MonoJob};
pub use process::Process;
pub use retry::RetryTimer;
pub use ticks::{currticks, TICKS_PER_SEC};
pub use uri::Uri;
