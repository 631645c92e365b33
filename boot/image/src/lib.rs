//! # cinder Boot Images
//!
//! The image registry and loaders. A fetched image is probed against each
//! registered type (first match wins); executing it produces a
//! [`image::BootPlan`] - the entry point, prepared memory writes and
//! register state - which the platform layer commits after the network
//! stack shuts down. The firmware cannot jump anywhere itself; platform
//! glue is out of scope here.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod elf;
pub mod image;
pub mod multiboot;
pub mod nbi;

pub use image::{
    fetch_uri, find_image, images, register_image, register_image_type, BootPlan, Image,
    ImageType, Segment,
};

static INIT: spin::Once<()> = spin::Once::new();

/// Register the built-in image types. Idempotent.
pub fn image_init() {
    INIT.call_once(|| {
        multiboot::init();
        nbi::init();
        elf::init();
    });
}
