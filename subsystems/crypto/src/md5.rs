//! MD5 (RFC 1321). Needed for CHAP and legacy TLS PRF components; not for
//! anything that requires collision resistance.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::digest::{Digest, MdState};

const S: [[u32; 4]; 4] = [
    [7, 12, 17, 22],
    [5, 9, 14, 20],
    [4, 11, 16, 23],
    [6, 10, 15, 21],
];

const T: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee,
    0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
    0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be,
    0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
    0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa,
    0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
    0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed,
    0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
    0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c,
    0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
    0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05,
    0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
    0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039,
    0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1,
    0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];

#[derive(Clone)]
pub struct Md5 {
    h: [u32; 4],
    md: MdState,
}

const INIT: [u32; 4] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

impl Md5 {
    pub fn new() -> Self {
        Self {
            h: INIT,
            md: MdState::new(),
        }
    }
}

impl Default for Md5 {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(h: &mut [u32; 4], block: &[u8; 64]) {
    let mut m = [0u32; 16];
    for (i, word) in m.iter_mut().enumerate() {
        *word = u32::from_le_bytes([
            block[i * 4],
            block[i * 4 + 1],
            block[i * 4 + 2],
            block[i * 4 + 3],
        ]);
    }
    let (mut a, mut b, mut c, mut d) = (h[0], h[1], h[2], h[3]);
    for i in 0..64 {
        let (f, g) = match i / 16 {
            0 => ((b & c) | (!b & d), i),
            1 => ((d & b) | (!d & c), (5 * i + 1) % 16),
            2 => (b ^ c ^ d, (3 * i + 5) % 16),
            _ => (c ^ (b | !d), (7 * i) % 16),
        };
        let tmp = d;
        d = c;
        c = b;
        b = b.wrapping_add(
            a.wrapping_add(f)
                .wrapping_add(T[i])
                .wrapping_add(m[g])
                .rotate_left(S[i / 16][i % 4]),
        );
        a = tmp;
    }
    h[0] = h[0].wrapping_add(a);
    h[1] = h[1].wrapping_add(b);
    h[2] = h[2].wrapping_add(c);
    h[3] = h[3].wrapping_add(d);
}

impl Digest for Md5 {
    fn name(&self) -> &'static str {
        "md5"
    }

    fn block_size(&self) -> usize {
        64
    }

    fn digest_size(&self) -> usize {
        16
    }

    fn update(&mut self, data: &[u8]) {
        let h = &mut self.h;
        self.md.update(data, |block| compress(h, block));
    }

    fn finalize(&mut self) -> Vec<u8> {
        let h = &mut self.h;
        self.md.pad(false, |block| compress(h, block));
        let mut out = Vec::with_capacity(16);
        for word in self.h {
            out.extend_from_slice(&word.to_le_bytes());
        }
        self.h = INIT;
        out
    }

    fn boxed_clone(&self) -> Box<dyn Digest> {
        Box::new(self.clone())
    }
}

/// Constructor for runtime digest selection
pub fn md5() -> Box<dyn Digest> {
    Box::new(Md5::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_kernel::hex;

    fn md5_hex(data: &[u8]) -> alloc::string::String {
        let mut ctx = Md5::new();
        ctx.update(data);
        hex::encode(&ctx.finalize(), "")
    }

    #[test]
    fn rfc1321_vectors() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            md5_hex(b"message digest"),
            "f96b697d7cb7938d525a2f31aaf161d0"
        );
    }

    #[test]
    fn long_input_crosses_blocks() {
        let data = [0x61u8; 1000];
        let mut ctx = Md5::new();
        ctx.update(&data);
        let one = ctx.finalize();
        for chunk in data.chunks(7) {
            ctx.update(chunk);
        }
        assert_eq!(ctx.finalize(), one);
    }
}
