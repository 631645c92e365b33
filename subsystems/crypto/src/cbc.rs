//! CBC mode over any block cipher. Used by the TLS AES-CBC cipher suites;
//! padding is the caller's business (TLS has its own padding rules).

use alloc::vec::Vec;

use cinder_kernel::error::{Error, Result};

use crate::cipher::BlockCipher;

/// CBC chaining state
pub struct Cbc<C: BlockCipher> {
    cipher: C,
    iv: Vec<u8>,
}

impl<C: BlockCipher> Cbc<C> {
    pub fn new(cipher: C, iv: &[u8]) -> Result<Self> {
        if iv.len() != cipher.block_size() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            cipher,
            iv: iv.to_vec(),
        })
    }

    /// Replace the chaining IV (per-record explicit IVs)
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        if iv.len() != self.cipher.block_size() {
            return Err(Error::InvalidArgument);
        }
        self.iv.copy_from_slice(iv);
        Ok(())
    }

    /// Encrypt whole blocks in place
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
        let bs = self.cipher.block_size();
        if data.len() % bs != 0 {
            return Err(Error::InvalidArgument);
        }
        for block in data.chunks_mut(bs) {
            for (b, iv) in block.iter_mut().zip(self.iv.iter()) {
                *b ^= iv;
            }
            self.cipher.encrypt_block(block);
            self.iv.copy_from_slice(block);
        }
        Ok(())
    }

    /// Decrypt whole blocks in place
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
        let bs = self.cipher.block_size();
        if data.len() % bs != 0 {
            return Err(Error::InvalidArgument);
        }
        let mut prev = self.iv.clone();
        for block in data.chunks_mut(bs) {
            let ct = block.to_vec();
            self.cipher.decrypt_block(block);
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            prev = ct;
        }
        self.iv = prev;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aes::Aes;
    use cinder_kernel::hex;

    #[test]
    fn nist_sp800_38a_cbc_aes128() {
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let mut data = hex::decode(
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51",
        )
        .unwrap();

        let mut enc = Cbc::new(Aes::new(&key).unwrap(), &iv).unwrap();
        enc.encrypt(&mut data).unwrap();
        assert_eq!(
            hex::encode(&data, ""),
            "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"
        );

        let mut dec = Cbc::new(Aes::new(&key).unwrap(), &iv).unwrap();
        dec.decrypt(&mut data).unwrap();
        assert_eq!(
            hex::encode(&data, ""),
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51"
        );
    }

    #[test]
    fn partial_block_rejected() {
        let key = [0u8; 16];
        let mut cbc = Cbc::new(Aes::new(&key).unwrap(), &[0u8; 16]).unwrap();
        let mut data = [0u8; 15];
        assert!(cbc.encrypt(&mut data).is_err());
    }
}
