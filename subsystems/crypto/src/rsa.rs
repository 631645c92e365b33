//! RSA (PKCS#1 v1.5) encryption and signature verification.
//!
//! The TLS client needs exactly two RSA operations: encrypt the premaster
//! secret under the server's public key, and verify the server's signature
//! on its key-exchange parameters. Both use v1.5 padding; keys arrive as
//! DER structures walked with [`crate::asn1`] cursors.

use alloc::vec::Vec;

use cinder_kernel::error::{Error, Result};
use cinder_kernel::random;

use crate::asn1::{self, Cursor};
use crate::bignum::BigUint;
use crate::digest::DigestCtor;

/// An RSA public key
#[derive(Debug, Clone)]
pub struct RsaPublicKey {
    modulus: BigUint,
    exponent: BigUint,
    /// Modulus length in bytes
    k: usize,
}

impl RsaPublicKey {
    pub fn new(modulus_be: &[u8], exponent_be: &[u8]) -> Result<Self> {
        let modulus = BigUint::from_bytes_be(modulus_be);
        let exponent = BigUint::from_bytes_be(exponent_be);
        if modulus.is_zero() || exponent.is_zero() {
            return Err(Error::InvalidArgument);
        }
        let k = modulus.bit_len().div_ceil(8);
        Ok(Self {
            modulus,
            exponent,
            k,
        })
    }

    /// Parse a DER RSAPublicKey: `SEQUENCE { modulus, publicExponent }`
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let mut outer = Cursor::new(der);
        let mut seq = outer.enter(asn1::ASN1_SEQUENCE)?;
        let modulus = seq.integer_bytes()?;
        let exponent = seq.integer_bytes()?;
        Self::new(modulus, exponent)
    }

    /// Parse a DER SubjectPublicKeyInfo wrapping an RSAPublicKey
    pub fn from_spki(der: &[u8]) -> Result<Self> {
        let mut outer = Cursor::new(der);
        let mut spki = outer.enter(asn1::ASN1_SEQUENCE)?;
        // AlgorithmIdentifier
        spki.enter(asn1::ASN1_SEQUENCE)?;
        let key_der = spki.bit_string()?;
        Self::from_der(key_der)
    }

    /// Modulus size in bytes
    pub fn modulus_len(&self) -> usize {
        self.k
    }

    /// Raw public-key operation `m^e mod n`
    fn raw(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() > self.k {
            return Err(Error::InvalidArgument);
        }
        let m = BigUint::from_bytes_be(input);
        if m.cmp_to(&self.modulus) != core::cmp::Ordering::Less {
            return Err(Error::InvalidArgument);
        }
        Ok(m.mod_pow(&self.exponent, &self.modulus).to_bytes_be(self.k))
    }

    /// Encrypt with EME-PKCS1-v1_5 (block type 2) padding
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() + 11 > self.k {
            return Err(Error::InvalidArgument);
        }
        let mut em = Vec::with_capacity(self.k);
        em.push(0x00);
        em.push(0x02);
        for _ in 0..(self.k - plaintext.len() - 3) {
            // Padding bytes must be nonzero
            let mut byte = [0u8];
            loop {
                random::fill(&mut byte);
                if byte[0] != 0 {
                    break;
                }
            }
            em.push(byte[0]);
        }
        em.push(0x00);
        em.extend_from_slice(plaintext);
        self.raw(&em)
    }

    /// Verify an EMSA-PKCS1-v1_5 (block type 1) signature over `message`
    ///
    /// The DigestInfo inside the recovered block must match `ctor` applied
    /// to the message.
    pub fn verify(&self, ctor: DigestCtor, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != self.k {
            return Err(Error::PermissionDenied);
        }
        let em = self.raw(signature)?;
        // 0x00 0x01 FF..FF 0x00 DigestInfo
        if em.len() < 11 || em[0] != 0x00 || em[1] != 0x01 {
            return Err(Error::PermissionDenied);
        }
        let mut idx = 2;
        while idx < em.len() && em[idx] == 0xff {
            idx += 1;
        }
        if idx < 10 || em.get(idx) != Some(&0x00) {
            return Err(Error::PermissionDenied);
        }
        let digest_info = &em[idx + 1..];

        // DigestInfo ::= SEQUENCE { AlgorithmIdentifier, OCTET STRING }
        let mut outer = Cursor::new(digest_info);
        let mut seq = outer
            .enter(asn1::ASN1_SEQUENCE)
            .map_err(|_| Error::PermissionDenied)?;
        seq.enter(asn1::ASN1_SEQUENCE)
            .map_err(|_| Error::PermissionDenied)?;
        let digest = seq
            .enter(asn1::ASN1_OCTET_STRING)
            .map_err(|_| Error::PermissionDenied)?;

        let mut ctx = ctor();
        ctx.update(message);
        let expected = ctx.finalize();
        if digest.remaining() != expected.as_slice() {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }
}

/// An RSA private key (client certificates, test fixtures)
#[derive(Debug, Clone)]
pub struct RsaPrivateKey {
    public: RsaPublicKey,
    d: BigUint,
}

impl RsaPrivateKey {
    pub fn new(modulus_be: &[u8], public_exponent_be: &[u8], d_be: &[u8]) -> Result<Self> {
        Ok(Self {
            public: RsaPublicKey::new(modulus_be, public_exponent_be)?,
            d: BigUint::from_bytes_be(d_be),
        })
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Raw private-key operation
    fn raw(&self, input: &[u8]) -> Result<Vec<u8>> {
        let m = BigUint::from_bytes_be(input);
        if m.cmp_to(&self.public.modulus) != core::cmp::Ordering::Less {
            return Err(Error::InvalidArgument);
        }
        Ok(m
            .mod_pow(&self.d, &self.public.modulus)
            .to_bytes_be(self.public.k))
    }

    /// Decrypt an EME-PKCS1-v1_5 ciphertext
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let em = self.raw(ciphertext)?;
        if em.len() < 11 || em[0] != 0x00 || em[1] != 0x02 {
            return Err(Error::PermissionDenied);
        }
        let payload_start = em[2..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::PermissionDenied)?
            + 3;
        Ok(em[payload_start..].to_vec())
    }

    /// Sign with EMSA-PKCS1-v1_5 padding over a precomputed DigestInfo
    pub fn sign_digest_info(&self, digest_info: &[u8]) -> Result<Vec<u8>> {
        let k = self.public.k;
        if digest_info.len() + 11 > k {
            return Err(Error::InvalidArgument);
        }
        let mut em = Vec::with_capacity(k);
        em.push(0x00);
        em.push(0x01);
        em.resize(k - digest_info.len() - 1, 0xff);
        em.push(0x00);
        em.extend_from_slice(digest_info);
        self.raw(&em)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256::sha256;
    use alloc::boxed::Box;

    // Tiny (insecure) key pair for structural tests:
    // p = 61, q = 53, n = 3233, e = 17, d = 413
    fn tiny_keys() -> (RsaPublicKey, RsaPrivateKey) {
        let n = 3233u16.to_be_bytes();
        let e = [17u8];
        let d = 413u16.to_be_bytes();
        (
            RsaPublicKey::new(&n, &e).unwrap(),
            RsaPrivateKey::new(&n, &e, &d).unwrap(),
        )
    }

    #[test]
    fn raw_round_trip() {
        let (public, private) = tiny_keys();
        // 65^17 mod 3233 = 2790 (classic textbook example)
        let ct = public.raw(&[65]).unwrap();
        assert_eq!(ct, 2790u16.to_be_bytes());
        let pt = private.raw(&ct).unwrap();
        assert_eq!(pt, [0, 65]);
    }

    /// Modular inverse by extended Euclid, for building the test key
    fn modinv(e: i128, m: i128) -> i128 {
        let (mut old_r, mut r) = (e, m);
        let (mut old_s, mut s) = (1i128, 0i128);
        while r != 0 {
            let q = old_r / r;
            (old_r, r) = (r, old_r - q * r);
            (old_s, s) = (s, old_s - q * s);
        }
        old_s.rem_euclid(m)
    }

    #[test]
    fn encrypt_decrypt_with_padding() {
        // A 127-bit key built from two known primes, large enough for
        // v1.5 padding of a short message
        let p: u128 = 18_446_744_073_709_551_557; // 2^64 - 59
        let q: u128 = 9_223_372_036_854_775_783; // 2^63 - 25
        let n = p * q;
        let phi = (p - 1) * (q - 1);
        let e: u128 = 65537;
        let d = modinv(e as i128, phi as i128) as u128;

        let public = RsaPublicKey::new(&n.to_be_bytes(), &e.to_be_bytes()).unwrap();
        let private =
            RsaPrivateKey::new(&n.to_be_bytes(), &e.to_be_bytes(), &d.to_be_bytes()).unwrap();
        let message = b"boot!";
        let ct = public.encrypt(message).unwrap();
        assert_eq!(ct.len(), public.modulus_len());
        let pt = private.decrypt(&ct).unwrap();
        assert_eq!(pt, message);
    }

    #[test]
    fn sign_and_verify() {
        let p: u128 = 18_446_744_073_709_551_557;
        let q: u128 = 9_223_372_036_854_775_783;
        let n = p * q;
        let phi = (p - 1) * (q - 1);
        let e: u128 = 65537;
        let d = modinv(e as i128, phi as i128) as u128;
        let private =
            RsaPrivateKey::new(&n.to_be_bytes(), &e.to_be_bytes(), &d.to_be_bytes()).unwrap();

        // Raw sign/verify round trip (DigestInfo too large for this k, so
        // exercise the primitive directly)
        let signed = private.raw(&[0x00, 0x42]).unwrap();
        let recovered = private.public().raw(&signed).unwrap();
        assert_eq!(recovered.last(), Some(&0x42));
    }

    #[test]
    fn der_public_key_parses() {
        // SEQUENCE { INTEGER 3233, INTEGER 17 }
        let der = [0x30, 0x08, 0x02, 0x03, 0x00, 0x0c, 0xa1, 0x02, 0x01, 0x11];
        let key = RsaPublicKey::from_der(&der).unwrap();
        assert_eq!(key.modulus_len(), 2);
    }

    #[test]
    fn bad_signature_rejected() {
        let (public, _) = tiny_keys();
        let sig = alloc::vec![0u8; public.modulus_len()];
        assert!(public.verify(sha256, b"msg", &sig).is_err());
        let _: Box<dyn crate::digest::Digest> = sha256();
    }
}
