//! NIST P-256 (secp256r1) for ECDHE key agreement.
//!
//! Short-Weierstrass point arithmetic in affine coordinates over the
//! generic bignum unit. Portable and correctness-first; the handful of
//! scalar multiplications in a TLS handshake do not justify a dedicated
//! field implementation.

use spin::Lazy;

use cinder_kernel::error::{Error, Result};

use crate::bignum::BigUint;

struct Curve {
    p: BigUint,
    b: BigUint,
    gx: BigUint,
    gy: BigUint,
}

static CURVE: Lazy<Curve> = Lazy::new(|| Curve {
    p: from_hex("ffffffff00000001000000000000000000000000ffffffffffffffffffffffff"),
    b: from_hex("5ac635d8aa3a93e7b3ebbd55769886bc651d06b0cc53b0f63bce3c3e27d2604b"),
    gx: from_hex("6b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296"),
    gy: from_hex("4fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5"),
});

fn from_hex(s: &str) -> BigUint {
    let mut bytes = alloc::vec::Vec::with_capacity(s.len() / 2);
    let mut iter = s.as_bytes().chunks(2);
    for pair in &mut iter {
        let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
        let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
        bytes.push((hi << 4) | lo);
    }
    BigUint::from_bytes_be(&bytes)
}

/// A point on the curve (None = point at infinity)
#[derive(Clone, PartialEq, Eq)]
pub struct Point(Option<(BigUint, BigUint)>);

impl Point {
    pub fn infinity() -> Self {
        Point(None)
    }

    /// The curve generator
    pub fn generator() -> Self {
        let curve = &*CURVE;
        Point(Some((curve.gx.clone(), curve.gy.clone())))
    }

    /// Parse an uncompressed SEC1 point (0x04 || X || Y)
    pub fn from_sec1(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 || bytes[0] != 0x04 {
            return Err(Error::Protocol);
        }
        let x = BigUint::from_bytes_be(&bytes[1..33]);
        let y = BigUint::from_bytes_be(&bytes[33..65]);
        let point = Point(Some((x, y)));
        if !point.on_curve() {
            return Err(Error::Protocol);
        }
        Ok(point)
    }

    /// Serialise as uncompressed SEC1
    pub fn to_sec1(&self) -> Result<[u8; 65]> {
        let (x, y) = self.0.as_ref().ok_or(Error::InvalidArgument)?;
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..33].copy_from_slice(&x.to_bytes_be(32));
        out[33..65].copy_from_slice(&y.to_bytes_be(32));
        Ok(out)
    }

    /// X coordinate as 32 big-endian bytes (the ECDH shared secret)
    pub fn x_bytes(&self) -> Result<[u8; 32]> {
        let (x, _) = self.0.as_ref().ok_or(Error::InvalidArgument)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&x.to_bytes_be(32));
        Ok(out)
    }

    /// Check `y^2 == x^3 - 3x + b (mod p)`
    pub fn on_curve(&self) -> bool {
        let curve = &*CURVE;
        let p = &curve.p;
        match &self.0 {
            None => true,
            Some((x, y)) => {
                let lhs = y.mul_mod(y, p);
                let x3 = x.mul_mod(x, p).mul_mod(x, p);
                let three_x = x.mul_mod(&BigUint::from_u32(3), p);
                let rhs = x3.sub_mod(&three_x, p).add_mod(&curve.b, p);
                lhs == rhs
            }
        }
    }

    /// Point addition (affine, with the doubling special case)
    pub fn add(&self, other: &Point) -> Point {
        let curve = &*CURVE;
        let p = &curve.p;
        let (x1, y1) = match &self.0 {
            None => return other.clone(),
            Some(coords) => coords,
        };
        let (x2, y2) = match &other.0 {
            None => return self.clone(),
            Some(coords) => coords,
        };

        let lambda = if x1 == x2 {
            if y1.add_mod(y2, p).is_zero() {
                return Point::infinity();
            }
            // (3x^2 - 3) / 2y  (a = -3)
            let num = x1
                .mul_mod(x1, p)
                .mul_mod(&BigUint::from_u32(3), p)
                .sub_mod(&BigUint::from_u32(3), p);
            let den = y1.mul_mod(&BigUint::from_u32(2), p);
            num.mul_mod(&den.mod_inverse_prime(p), p)
        } else {
            let num = y2.sub_mod(y1, p);
            let den = x2.sub_mod(x1, p);
            num.mul_mod(&den.mod_inverse_prime(p), p)
        };

        let x3 = lambda.mul_mod(&lambda, p).sub_mod(x1, p).sub_mod(x2, p);
        let y3 = lambda.mul_mod(&x1.sub_mod(&x3, p), p).sub_mod(y1, p);
        Point(Some((x3, y3)))
    }

    /// Scalar multiplication by double-and-add
    pub fn mul(&self, scalar: &BigUint) -> Point {
        let mut result = Point::infinity();
        let mut addend = self.clone();
        for i in 0..scalar.bit_len() {
            if scalar.bit(i) {
                result = result.add(&addend);
            }
            addend = addend.add(&addend);
        }
        result
    }
}

impl core::fmt::Debug for Point {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.0 {
            None => f.write_str("Point(infinity)"),
            Some(_) => f.write_str("Point(..)"),
        }
    }
}

/// Derive the public key point for a private scalar
pub fn public_key(scalar_be: &[u8; 32]) -> Result<[u8; 65]> {
    let scalar = BigUint::from_bytes_be(scalar_be);
    Point::generator().mul(&scalar).to_sec1()
}

/// ECDH: multiply the peer's point by our scalar, returning the X
/// coordinate
pub fn shared_secret(scalar_be: &[u8; 32], peer_sec1: &[u8]) -> Result<[u8; 32]> {
    let scalar = BigUint::from_bytes_be(scalar_be);
    let peer = Point::from_sec1(peer_sec1)?;
    peer.mul(&scalar).x_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_on_curve() {
        assert!(Point::generator().on_curve());
    }

    #[test]
    fn doubling_stays_on_curve() {
        let g = Point::generator();
        let g2 = g.add(&g);
        assert!(g2.on_curve());
        let g3 = g2.add(&g);
        assert!(g3.on_curve());
        // 2G + G == G + 2G
        assert_eq!(g3, g.add(&g2));
    }

    #[test]
    fn scalar_mul_matches_repeated_addition() {
        let g = Point::generator();
        let five = BigUint::from_u32(5);
        let by_mul = g.mul(&five);
        let by_add = g.add(&g).add(&g).add(&g).add(&g);
        assert_eq!(by_mul, by_add);
        assert!(by_mul.on_curve());
    }

    #[test]
    fn ecdh_agreement() {
        let a = [0x11u8; 32];
        let b = [0x22u8; 32];
        let a_pub = public_key(&a).unwrap();
        let b_pub = public_key(&b).unwrap();
        let ab = shared_secret(&a, &b_pub).unwrap();
        let ba = shared_secret(&b, &a_pub).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn sec1_round_trip_rejects_garbage() {
        let g = Point::generator().to_sec1().unwrap();
        assert!(Point::from_sec1(&g).is_ok());
        let mut bad = g;
        bad[10] ^= 1;
        assert!(Point::from_sec1(&bad).is_err());
    }
}
