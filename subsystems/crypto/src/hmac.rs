//! HMAC (RFC 2104) over any registered digest.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::digest::{Digest, DigestCtor};

/// Keyed HMAC context
pub struct Hmac {
    inner: Box<dyn Digest>,
    outer_pad: Vec<u8>,
    ctor: DigestCtor,
}

impl Hmac {
    /// Initialise with a key; oversized keys are digested first
    pub fn new(ctor: DigestCtor, key: &[u8]) -> Self {
        let probe = ctor();
        let block_size = probe.block_size();
        drop(probe);

        let key = if key.len() > block_size {
            let mut ctx = ctor();
            ctx.update(key);
            ctx.finalize()
        } else {
            key.to_vec()
        };

        let mut ipad = alloc::vec![0x36u8; block_size];
        let mut opad = alloc::vec![0x5cu8; block_size];
        for (i, &k) in key.iter().enumerate() {
            ipad[i] ^= k;
            opad[i] ^= k;
        }

        let mut inner = ctor();
        inner.update(&ipad);
        Self {
            inner,
            outer_pad: opad,
            ctor,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(mut self) -> Vec<u8> {
        let inner_digest = self.inner.finalize();
        let mut outer = (self.ctor)();
        outer.update(&self.outer_pad);
        outer.update(&inner_digest);
        outer.finalize()
    }
}

/// One-shot HMAC
pub fn hmac(ctor: DigestCtor, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut ctx = Hmac::new(ctor, key);
    ctx.update(data);
    ctx.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md5::md5;
    use crate::sha256::sha256;
    use cinder_kernel::hex;

    #[test]
    fn rfc2202_md5_vector() {
        // Key = 16 x 0x0b, data "Hi There"
        let mac = hmac(md5, &[0x0b; 16], b"Hi There");
        assert_eq!(hex::encode(&mac, ""), "9294727a3638bb1c13f48ef8158bfc9d");
    }

    #[test]
    fn rfc4231_sha256_vectors() {
        let mac = hmac(sha256, &[0x0b; 20], b"Hi There");
        assert_eq!(
            hex::encode(&mac, ""),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
        let mac = hmac(sha256, b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(&mac, ""),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn oversized_key_is_digested() {
        let long_key = [0xaa; 100];
        // Must not panic and must differ from the truncated-key MAC
        let a = hmac(sha256, &long_key, b"x");
        let b = hmac(sha256, &long_key[..64], b"x");
        assert_ne!(a, b);
    }
}
