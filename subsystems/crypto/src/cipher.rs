//! Block cipher vtable.

use cinder_kernel::error::Result;

/// A keyed block cipher instance
pub trait BlockCipher: Send + Sync {
    /// Algorithm name
    fn name(&self) -> &'static str;

    /// Block size in bytes
    fn block_size(&self) -> usize;

    /// Encrypt one block in place (`block.len() == block_size`)
    fn encrypt_block(&self, block: &mut [u8]);

    /// Decrypt one block in place
    fn decrypt_block(&self, block: &mut [u8]);
}

/// Constructor type for runtime-selected ciphers
pub type CipherCtor = fn(key: &[u8]) -> Result<alloc::boxed::Box<dyn BlockCipher>>;
