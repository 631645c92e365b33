//! The TLS 1.2 pseudo-random function (RFC 5246 section 5).
//!
//! `PRF(secret, label, seed) = P_<hash>(secret, label + seed)`, where
//! `P_hash` chains HMAC outputs until enough material is produced.

use alloc::vec::Vec;

use cinder_crypto::digest::DigestCtor;
use cinder_crypto::hmac::hmac;

/// P_hash expansion to `out_len` bytes
fn p_hash(ctor: DigestCtor, secret: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len);
    // A(1) = HMAC(secret, seed)
    let mut a = hmac(ctor, secret, seed);
    while out.len() < out_len {
        let mut input = a.clone();
        input.extend_from_slice(seed);
        let block = hmac(ctor, secret, &input);
        out.extend_from_slice(&block);
        a = hmac(ctor, secret, &a);
    }
    out.truncate(out_len);
    out
}

/// The TLS 1.2 PRF
pub fn prf(
    ctor: DigestCtor,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out_len: usize,
) -> Vec<u8> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);
    p_hash(ctor, secret, &label_seed, out_len)
}

/// Master secret derivation (48 bytes)
pub fn master_secret(
    ctor: DigestCtor,
    premaster: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    prf(ctor, premaster, b"master secret", &seed, 48)
}

/// Key block derivation (note the reversed random order)
pub fn key_block(
    ctor: DigestCtor,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    out_len: usize,
) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    prf(ctor, master, b"key expansion", &seed, out_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_crypto::sha256::sha256;

    #[test]
    fn produces_requested_length() {
        for len in [1, 12, 48, 100, 136] {
            assert_eq!(prf(sha256, b"secret", b"label", b"seed", len).len(), len);
        }
    }

    #[test]
    fn deterministic_and_input_sensitive() {
        let a = prf(sha256, b"secret", b"test label", b"seed", 32);
        let b = prf(sha256, b"secret", b"test label", b"seed", 32);
        let c = prf(sha256, b"secret", b"test label", b"seed2", 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn master_secret_is_48_bytes() {
        let ms = master_secret(sha256, &[0x0b; 48], &[1; 32], &[2; 32]);
        assert_eq!(ms.len(), 48);
        // Swapped randoms give a different secret
        let ms2 = master_secret(sha256, &[0x0b; 48], &[2; 32], &[1; 32]);
        assert_ne!(ms, ms2);
    }
}
