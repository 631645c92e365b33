//! The block-device interface SAN transports implement.

use cinder_kernel::error::Result;

/// Device geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Block size in bytes
    pub block_size: usize,
    /// Total number of blocks
    pub blocks: u64,
    /// Maximum blocks per command
    pub max_xfer: usize,
}

/// A block device
///
/// Calls are blocking from the caller's perspective: implementations spin
/// the scheduler internally until the command completes or times out.
pub trait BlockDevice: Send + Sync {
    /// Read `count` blocks starting at `lba` into `buf`
    fn read(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `count` blocks starting at `lba` from `buf`
    fn write(&self, lba: u64, count: usize, buf: &[u8]) -> Result<()>;

    /// Report geometry
    fn capacity(&self) -> Result<Capacity>;

    /// Reset the transport (command timeout recovery)
    fn reset(&self) -> Result<()>;
}
