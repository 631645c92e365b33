//! Message digest vtable.
//!
//! All digests here are Merkle-Damgard constructions over 512-bit blocks,
//! so they share the buffering and length-padding logic in
//! [`MdState`]; each algorithm supplies its compression function.

use alloc::boxed::Box;
use alloc::vec::Vec;

/// A message digest algorithm instance
pub trait Digest: Send + Sync {
    /// Algorithm name
    fn name(&self) -> &'static str;

    /// Input block size in bytes (HMAC padding unit)
    fn block_size(&self) -> usize;

    /// Output size in bytes
    fn digest_size(&self) -> usize;

    /// Absorb input
    fn update(&mut self, data: &[u8]);

    /// Produce the digest and reset to the initial state
    fn finalize(&mut self) -> Vec<u8>;

    /// Clone into a fresh box (transcript forking)
    fn boxed_clone(&self) -> Box<dyn Digest>;
}

/// Constructor type for runtime-selected digests
pub type DigestCtor = fn() -> Box<dyn Digest>;

/// One-shot convenience
pub fn digest_of(ctor: DigestCtor, data: &[u8]) -> Vec<u8> {
    let mut ctx = ctor();
    ctx.update(data);
    ctx.finalize()
}

/// Shared 64-byte-block Merkle-Damgard buffering
#[derive(Clone)]
pub(crate) struct MdState {
    buf: [u8; 64],
    buffered: usize,
    /// Total message length in bytes
    pub(crate) length: u64,
}

impl MdState {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; 64],
            buffered: 0,
            length: 0,
        }
    }

    /// Feed data, invoking `compress` for each complete 64-byte block
    pub(crate) fn update(&mut self, mut data: &[u8], mut compress: impl FnMut(&[u8; 64])) {
        self.length = self.length.wrapping_add(data.len() as u64);
        if self.buffered > 0 {
            let take = data.len().min(64 - self.buffered);
            self.buf[self.buffered..self.buffered + take].copy_from_slice(&data[..take]);
            self.buffered += take;
            data = &data[take..];
            if self.buffered == 64 {
                let block = self.buf;
                compress(&block);
                self.buffered = 0;
            }
        }
        while data.len() >= 64 {
            let mut block = [0u8; 64];
            block.copy_from_slice(&data[..64]);
            compress(&block);
            data = &data[64..];
        }
        if !data.is_empty() {
            self.buf[..data.len()].copy_from_slice(data);
            self.buffered = data.len();
        }
    }

    /// Append the 0x80 / zero padding and the encoded bit length, invoking
    /// `compress` for the final block(s). `big_endian` selects the length
    /// encoding (SHA family) versus little-endian (MD4/MD5).
    pub(crate) fn pad(&mut self, big_endian: bool, mut compress: impl FnMut(&[u8; 64])) {
        let bit_length = self.length.wrapping_mul(8);
        let mut block = [0u8; 64];
        block[..self.buffered].copy_from_slice(&self.buf[..self.buffered]);
        block[self.buffered] = 0x80;
        if self.buffered + 1 + 8 > 64 {
            compress(&block);
            block = [0u8; 64];
        }
        let len_bytes = if big_endian {
            bit_length.to_be_bytes()
        } else {
            bit_length.to_le_bytes()
        };
        block[56..64].copy_from_slice(&len_bytes);
        compress(&block);
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{md5::Md5, sha1::Sha1, sha256::Sha256};

    #[test]
    fn incremental_equals_oneshot() {
        let mut a = Sha256::new();
        a.update(b"hello ");
        a.update(b"world");
        let mut b = Sha256::new();
        b.update(b"hello world");
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn finalize_resets() {
        let mut ctx = Md5::new();
        ctx.update(b"abc");
        let first = ctx.finalize();
        ctx.update(b"abc");
        assert_eq!(ctx.finalize(), first);
    }

    #[test]
    fn boxed_clone_forks_state() {
        let mut ctx: Box<dyn Digest> = Box::new(Sha1::new());
        ctx.update(b"common");
        let mut fork = ctx.boxed_clone();
        ctx.update(b"a");
        fork.update(b"b");
        assert_ne!(ctx.finalize(), fork.finalize());
    }
}
