//! Pseudo-random numbers for protocol identifiers.
//!
//! DHCP transaction IDs, DNS query IDs, TCP initial sequence numbers and
//! ephemeral ports all come from here. The generator is seeded from the tick
//! counter; this is not cryptographic randomness and must never be used for
//! key material.

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use spin::Mutex;

use crate::ticks::currticks;

static RNG: Mutex<Option<SmallRng>> = Mutex::new(None);

fn with_rng<T>(f: impl FnOnce(&mut SmallRng) -> T) -> T {
    let mut guard = RNG.lock();
    let rng = guard.get_or_insert_with(|| {
        SmallRng::seed_from_u64(currticks() ^ 0x5deb_ac1e_0f1e_du64)
    });
    f(rng)
}

/// A uniformly random 32-bit value
pub fn rand_u32() -> u32 {
    with_rng(|rng| rng.next_u32())
}

/// A uniformly random 16-bit value
pub fn rand_u16() -> u16 {
    rand_u32() as u16
}

/// Fill a buffer with random bytes
pub fn fill(buf: &mut [u8]) {
    with_rng(|rng| rng.fill_bytes(buf));
}

/// An ephemeral port in the IANA dynamic range (49152-65535)
pub fn ephemeral_port() -> u16 {
    49152 + (rand_u16() & 0x3fff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_ports_in_range() {
        for _ in 0..64 {
            let port = ephemeral_port();
            assert!(port >= 49152);
        }
    }

    #[test]
    fn fill_covers_buffer() {
        let mut buf = [0u8; 32];
        fill(&mut buf);
        // All-zero output from a 32-byte fill would indicate a broken seed
        assert!(buf.iter().any(|&b| b != 0));
    }
}
