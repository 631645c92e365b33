//! Arbitrary-precision unsigned integers for public-key operations.
//!
//! A portable word-wise implementation of the primitives the original
//! expresses in per-architecture assembly: add, subtract, shift, multiply,
//! and the modular exponentiation built from them. Correctness over speed;
//! an RSA handshake happens once per boot.

use alloc::vec;
use alloc::vec::Vec;

/// An unsigned big integer, little-endian 32-bit limbs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigUint {
    limbs: Vec<u32>,
}

impl BigUint {
    pub fn zero() -> Self {
        Self { limbs: vec![0] }
    }

    pub fn one() -> Self {
        Self { limbs: vec![1] }
    }

    pub fn from_u32(value: u32) -> Self {
        Self { limbs: vec![value] }
    }

    /// Parse big-endian bytes
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        let mut limbs = Vec::with_capacity(bytes.len().div_ceil(4));
        let mut iter = bytes.rchunks(4);
        for chunk in &mut iter {
            let mut limb = 0u32;
            for &b in chunk {
                limb = (limb << 8) | u32::from(b);
            }
            limbs.push(limb);
        }
        if limbs.is_empty() {
            limbs.push(0);
        }
        let mut out = Self { limbs };
        out.normalize();
        out
    }

    /// Serialise to big-endian bytes, zero-padded or trimmed to `len`
    pub fn to_bytes_be(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut idx = len;
        'outer: for limb in &self.limbs {
            for shift in [0, 8, 16, 24] {
                if idx == 0 {
                    break 'outer;
                }
                idx -= 1;
                out[idx] = (limb >> shift) as u8;
            }
        }
        out
    }

    /// Minimal big-endian serialisation (no leading zeros, "0" -> empty)
    pub fn to_bytes_be_minimal(&self) -> Vec<u8> {
        let full = self.to_bytes_be(self.limbs.len() * 4);
        let start = full.iter().position(|&b| b != 0).unwrap_or(full.len());
        full[start..].to_vec()
    }

    fn normalize(&mut self) {
        while self.limbs.len() > 1 && *self.limbs.last().unwrap_or(&0) == 0 {
            self.limbs.pop();
        }
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    pub fn is_odd(&self) -> bool {
        self.limbs[0] & 1 == 1
    }

    /// Number of significant bits
    pub fn bit_len(&self) -> usize {
        let top = *self.limbs.last().unwrap_or(&0);
        if top == 0 {
            return 0;
        }
        (self.limbs.len() - 1) * 32 + (32 - top.leading_zeros() as usize)
    }

    /// Value of bit `i`
    pub fn bit(&self, i: usize) -> bool {
        self.limbs
            .get(i / 32)
            .map(|l| (l >> (i % 32)) & 1 == 1)
            .unwrap_or(false)
    }

    pub fn cmp_to(&self, other: &Self) -> core::cmp::Ordering {
        use core::cmp::Ordering;
        let a_len = self.limbs.len();
        let b_len = other.limbs.len();
        let max = a_len.max(b_len);
        for i in (0..max).rev() {
            let a = self.limbs.get(i).copied().unwrap_or(0);
            let b = other.limbs.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                order => return order,
            }
        }
        Ordering::Equal
    }

    pub fn add(&self, other: &Self) -> Self {
        let max = self.limbs.len().max(other.limbs.len());
        let mut limbs = Vec::with_capacity(max + 1);
        let mut carry = 0u64;
        for i in 0..max {
            let a = u64::from(self.limbs.get(i).copied().unwrap_or(0));
            let b = u64::from(other.limbs.get(i).copied().unwrap_or(0));
            let sum = a + b + carry;
            limbs.push(sum as u32);
            carry = sum >> 32;
        }
        if carry != 0 {
            limbs.push(carry as u32);
        }
        let mut out = Self { limbs };
        out.normalize();
        out
    }

    /// Subtract, assuming `self >= other`
    pub fn sub(&self, other: &Self) -> Self {
        let mut limbs = Vec::with_capacity(self.limbs.len());
        let mut borrow = 0i64;
        for i in 0..self.limbs.len() {
            let a = i64::from(self.limbs[i]);
            let b = i64::from(other.limbs.get(i).copied().unwrap_or(0));
            let mut diff = a - b - borrow;
            if diff < 0 {
                diff += 1 << 32;
                borrow = 1;
            } else {
                borrow = 0;
            }
            limbs.push(diff as u32);
        }
        let mut out = Self { limbs };
        out.normalize();
        out
    }

    /// Shift left by `n` bits
    pub fn shl(&self, n: usize) -> Self {
        let limb_shift = n / 32;
        let bit_shift = n % 32;
        let mut limbs = vec![0u32; limb_shift];
        let mut carry = 0u32;
        for &limb in &self.limbs {
            if bit_shift == 0 {
                limbs.push(limb);
            } else {
                limbs.push((limb << bit_shift) | carry);
                carry = limb >> (32 - bit_shift);
            }
        }
        if bit_shift != 0 && carry != 0 {
            limbs.push(carry);
        }
        let mut out = Self { limbs };
        out.normalize();
        out
    }

    /// Shift right by `n` bits
    pub fn shr(&self, n: usize) -> Self {
        let limb_shift = n / 32;
        let bit_shift = n % 32;
        if limb_shift >= self.limbs.len() {
            return Self::zero();
        }
        let mut limbs = Vec::with_capacity(self.limbs.len() - limb_shift);
        for i in limb_shift..self.limbs.len() {
            let mut limb = self.limbs[i] >> bit_shift;
            if bit_shift != 0 {
                if let Some(&next) = self.limbs.get(i + 1) {
                    limb |= next << (32 - bit_shift);
                }
            }
            limbs.push(limb);
        }
        let mut out = Self { limbs };
        out.normalize();
        out
    }

    /// Schoolbook multiplication
    pub fn mul(&self, other: &Self) -> Self {
        let mut limbs = vec![0u32; self.limbs.len() + other.limbs.len()];
        for (i, &a) in self.limbs.iter().enumerate() {
            let mut carry = 0u64;
            for (j, &b) in other.limbs.iter().enumerate() {
                let idx = i + j;
                let sum = u64::from(limbs[idx]) + u64::from(a) * u64::from(b) + carry;
                limbs[idx] = sum as u32;
                carry = sum >> 32;
            }
            let mut idx = i + other.limbs.len();
            while carry != 0 {
                let sum = u64::from(limbs[idx]) + carry;
                limbs[idx] = sum as u32;
                carry = sum >> 32;
                idx += 1;
            }
        }
        let mut out = Self { limbs };
        out.normalize();
        out
    }

    /// Remainder modulo `m` by binary long division
    pub fn rem(&self, m: &Self) -> Self {
        use core::cmp::Ordering;
        if m.is_zero() {
            return Self::zero();
        }
        if self.cmp_to(m) == Ordering::Less {
            return self.clone();
        }
        let mut a = self.clone();
        let shift = a.bit_len() - m.bit_len();
        let mut d = m.shl(shift);
        for _ in 0..=shift {
            if a.cmp_to(&d) != Ordering::Less {
                a = a.sub(&d);
            }
            d = d.shr(1);
        }
        a
    }

    /// Modular addition
    pub fn add_mod(&self, other: &Self, m: &Self) -> Self {
        self.add(other).rem(m)
    }

    /// Modular subtraction
    pub fn sub_mod(&self, other: &Self, m: &Self) -> Self {
        use core::cmp::Ordering;
        let a = self.rem(m);
        let b = other.rem(m);
        if a.cmp_to(&b) == Ordering::Less {
            a.add(m).sub(&b)
        } else {
            a.sub(&b)
        }
    }

    /// Modular multiplication
    pub fn mul_mod(&self, other: &Self, m: &Self) -> Self {
        self.mul(other).rem(m)
    }

    /// Modular exponentiation by square-and-multiply
    pub fn mod_pow(&self, exponent: &Self, m: &Self) -> Self {
        if m.is_zero() {
            return Self::zero();
        }
        let mut result = Self::one();
        let base = self.rem(m);
        let bits = exponent.bit_len();
        for i in (0..bits).rev() {
            result = result.mul_mod(&result, m);
            if exponent.bit(i) {
                result = result.mul_mod(&base, m);
            }
        }
        result
    }

    /// Modular inverse modulo a prime, via Fermat's little theorem
    pub fn mod_inverse_prime(&self, p: &Self) -> Self {
        let exponent = p.sub(&Self::from_u32(2));
        self.mod_pow(&exponent, p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: u64) -> BigUint {
        BigUint::from_bytes_be(&v.to_be_bytes())
    }

    #[test]
    fn round_trip_bytes() {
        let x = BigUint::from_bytes_be(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(x.to_bytes_be(5), [0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(x.to_bytes_be(7), [0, 0, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(x.to_bytes_be_minimal(), [0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn arithmetic() {
        assert_eq!(n(1000).add(&n(2345)), n(3345));
        assert_eq!(n(100_000_000_000).sub(&n(1)), n(99_999_999_999));
        assert_eq!(n(0xffff_ffff).add(&n(1)), n(0x1_0000_0000));
        assert_eq!(n(12345).mul(&n(6789)), n(12345 * 6789));
        assert_eq!(n(1).shl(40), n(1 << 40));
        assert_eq!(n(1 << 40).shr(39), n(2));
    }

    #[test]
    fn remainder() {
        assert_eq!(n(1_000_003).rem(&n(97)), n(1_000_003 % 97));
        assert_eq!(n(5).rem(&n(100)), n(5));
        let big = BigUint::from_bytes_be(&[0xff; 32]);
        let m = BigUint::from_bytes_be(&[0x01, 0x00, 0x01]);
        // Verify via reconstruction: big = q*m + r is hard without div;
        // instead check r < m and (big - r) mod m == 0 by repeated identity
        let r = big.rem(&m);
        assert!(r.cmp_to(&m) == core::cmp::Ordering::Less);
        assert!(big.sub(&r).rem(&m).is_zero());
    }

    #[test]
    fn mod_pow_small() {
        // 4^13 mod 497 = 445
        assert_eq!(n(4).mod_pow(&n(13), &n(497)), n(445));
        // Fermat: a^(p-1) mod p == 1
        assert_eq!(n(17).mod_pow(&n(96), &n(97)), n(1));
    }

    #[test]
    fn mod_inverse() {
        let p = n(97);
        let inv = n(17).mod_inverse_prime(&p);
        assert_eq!(n(17).mul_mod(&inv, &p), n(1));
    }

    #[test]
    fn bit_len() {
        assert_eq!(n(0).bit_len(), 0);
        assert_eq!(n(1).bit_len(), 1);
        assert_eq!(n(0x100).bit_len(), 9);
        assert_eq!(BigUint::from_bytes_be(&[0x80, 0, 0, 0, 0]).bit_len(), 40);
    }
}
