//! # cinder Cryptography
//!
//! The cryptography the boot firmware actually needs: digests and HMAC for
//! TLS and request signing, AES/DES and GCM for record protection, bignum /
//! RSA / ECDHE for key exchange, and MSCHAPv2 for CHAP authentication.
//! This is not a general-purpose crypto library.
//!
//! Algorithms conform to small vtable-style traits ([`digest::Digest`],
//! [`cipher::BlockCipher`]) so protocol code can select them at runtime
//! without allocating per operation.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod asn1;
pub mod bignum;
pub mod cbc;
pub mod cipher;
pub mod des;
pub mod digest;
pub mod gcm;
pub mod hmac;
pub mod md4;
pub mod md5;
pub mod mschapv2;
pub mod p256;
pub mod rsa;
pub mod sha1;
pub mod sha256;
pub mod x25519;

mod aes;

pub use aes::Aes;
pub use cipher::BlockCipher;
pub use digest::Digest;
pub use gcm::AesGcm;
