//! SHA-1 (FIPS 180-4).

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::digest::{Digest, MdState};

const INIT: [u32; 5] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476, 0xc3d2e1f0];

#[derive(Clone)]
pub struct Sha1 {
    h: [u32; 5],
    md: MdState,
}

impl Sha1 {
    pub fn new() -> Self {
        Self {
            h: INIT,
            md: MdState::new(),
        }
    }
}

impl Default for Sha1 {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(h: &mut [u32; 5], block: &[u8; 64]) {
    let mut w = [0u32; 80];
    for i in 0..16 {
        w[i] = u32::from_be_bytes([
            block[i * 4],
            block[i * 4 + 1],
            block[i * 4 + 2],
            block[i * 4 + 3],
        ]);
    }
    for i in 16..80 {
        w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
    }

    let (mut a, mut b, mut c, mut d, mut e) = (h[0], h[1], h[2], h[3], h[4]);
    for (i, &word) in w.iter().enumerate() {
        let (f, k) = match i / 20 {
            0 => ((b & c) | (!b & d), 0x5a827999),
            1 => (b ^ c ^ d, 0x6ed9eba1),
            2 => ((b & c) | (b & d) | (c & d), 0x8f1bbcdc),
            _ => (b ^ c ^ d, 0xca62c1d6),
        };
        let tmp = a
            .rotate_left(5)
            .wrapping_add(f)
            .wrapping_add(e)
            .wrapping_add(k)
            .wrapping_add(word);
        e = d;
        d = c;
        c = b.rotate_left(30);
        b = a;
        a = tmp;
    }

    h[0] = h[0].wrapping_add(a);
    h[1] = h[1].wrapping_add(b);
    h[2] = h[2].wrapping_add(c);
    h[3] = h[3].wrapping_add(d);
    h[4] = h[4].wrapping_add(e);
}

impl Digest for Sha1 {
    fn name(&self) -> &'static str {
        "sha1"
    }

    fn block_size(&self) -> usize {
        64
    }

    fn digest_size(&self) -> usize {
        20
    }

    fn update(&mut self, data: &[u8]) {
        let h = &mut self.h;
        self.md.update(data, |block| compress(h, block));
    }

    fn finalize(&mut self) -> Vec<u8> {
        let h = &mut self.h;
        self.md.pad(true, |block| compress(h, block));
        let mut out = Vec::with_capacity(20);
        for word in self.h {
            out.extend_from_slice(&word.to_be_bytes());
        }
        self.h = INIT;
        out
    }

    fn boxed_clone(&self) -> Box<dyn Digest> {
        Box::new(self.clone())
    }
}

pub fn sha1() -> Box<dyn Digest> {
    Box::new(Sha1::new())
}
