//! X25519 (RFC 7748) for ECDHE key agreement.
//!
//! The Montgomery ladder over Curve25519, computed with the generic bignum
//! unit modulo `2^255 - 19`. Scalars and coordinates travel as the RFC's
//! little-endian 32-byte strings.

use spin::Lazy;

use crate::bignum::BigUint;

/// Field prime 2^255 - 19
static P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::one().shl(255).sub(&BigUint::from_u32(19))
});

/// (486662 - 2) / 4, the ladder constant a24
static A24: Lazy<BigUint> = Lazy::new(|| BigUint::from_u32(121_665));

fn decode_le(bytes: &[u8; 32]) -> BigUint {
    let mut be = *bytes;
    be.reverse();
    BigUint::from_bytes_be(&be)
}

fn encode_le(value: &BigUint) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&value.to_bytes_be(32));
    out.reverse();
    out
}

/// Clamp a scalar per RFC 7748
fn clamp(scalar: &[u8; 32]) -> [u8; 32] {
    let mut s = *scalar;
    s[0] &= 248;
    s[31] &= 127;
    s[31] |= 64;
    s
}

/// X25519 scalar multiplication
pub fn x25519(scalar: &[u8; 32], u: &[u8; 32]) -> [u8; 32] {
    let p = &*P;
    let a24 = &*A24;
    let k = decode_le(&clamp(scalar));
    let mut masked_u = *u;
    // The top bit of the u-coordinate is masked per the RFC
    masked_u[31] &= 127;
    let x1 = decode_le(&masked_u).rem(p);

    let mut x2 = BigUint::one();
    let mut z2 = BigUint::zero();
    let mut x3 = x1.clone();
    let mut z3 = BigUint::one();
    let mut swap = false;

    for i in (0..255).rev() {
        let bit = k.bit(i);
        if swap != bit {
            core::mem::swap(&mut x2, &mut x3);
            core::mem::swap(&mut z2, &mut z3);
        }
        swap = bit;

        let a = x2.add_mod(&z2, p);
        let aa = a.mul_mod(&a, p);
        let b = x2.sub_mod(&z2, p);
        let bb = b.mul_mod(&b, p);
        let e = aa.sub_mod(&bb, p);
        let c = x3.add_mod(&z3, p);
        let d = x3.sub_mod(&z3, p);
        let da = d.mul_mod(&a, p);
        let cb = c.mul_mod(&b, p);
        let da_plus_cb = da.add_mod(&cb, p);
        let da_minus_cb = da.sub_mod(&cb, p);
        x3 = da_plus_cb.mul_mod(&da_plus_cb, p);
        z3 = x1.mul_mod(&da_minus_cb.mul_mod(&da_minus_cb, p), p);
        x2 = aa.mul_mod(&bb, p);
        z2 = e.mul_mod(&aa.add_mod(&a24.mul_mod(&e, p), p), p);
    }

    if swap {
        core::mem::swap(&mut x2, &mut x3);
        core::mem::swap(&mut z2, &mut z3);
    }

    let result = x2.mul_mod(&z2.mod_inverse_prime(p), p);
    encode_le(&result)
}

/// The base point u = 9
pub fn base_point() -> [u8; 32] {
    let mut u = [0u8; 32];
    u[0] = 9;
    u
}

/// Derive the public key for a private scalar
pub fn public_key(scalar: &[u8; 32]) -> [u8; 32] {
    x25519(scalar, &base_point())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_kernel::hex;

    fn from_hex(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hex::decode(s).unwrap());
        out
    }

    #[test]
    fn rfc7748_vector_1() {
        let scalar =
            from_hex("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4");
        let u = from_hex("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c");
        let out = x25519(&scalar, &u);
        assert_eq!(
            hex::encode(&out, ""),
            "c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552"
        );
    }

    #[test]
    fn diffie_hellman_agreement() {
        // RFC 7748 section 6.1 key pairs
        let alice_priv =
            from_hex("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
        let bob_priv =
            from_hex("5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb");
        let alice_pub = public_key(&alice_priv);
        let bob_pub = public_key(&bob_priv);
        assert_eq!(
            hex::encode(&alice_pub, ""),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        let shared_ab = x25519(&alice_priv, &bob_pub);
        let shared_ba = x25519(&bob_priv, &alice_pub);
        assert_eq!(shared_ab, shared_ba);
        assert_eq!(
            hex::encode(&shared_ab, ""),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }
}
