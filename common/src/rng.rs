//! Random number generation utilities

use std::num::NonZeroU32;

use rand_core::impls;
pub use rand_core::{CryptoRng, RngCore};
use ring::rand::SecureRandom;

const RAND_ERROR_CODE: NonZeroU32 =
    NonZeroU32::new(rand_core::Error::CUSTOM_START).unwrap();

/// A succinct trait alias for a Cryptographically Secure PRNG.
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng> Crng for R {}

/// A compatibility wrapper so we can use `ring`'s PRG with `rand` traits.
#[derive(Clone, Debug)]
pub struct SysRng(ring::rand::SystemRandom);

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

impl SysRng {
    pub fn new() -> Self {
        Self(ring::rand::SystemRandom::new())
    }

    /// A uniformly random `u64` in `[0, bound)`. Used for jitter; the tiny
    /// modulo bias is irrelevant there.
    pub fn gen_range(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.next_u64() % bound
    }
}

/// [`ring::rand::SystemRandom`] is a cryptographically secure PRG.
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        impls::next_u32_via_fill(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest).expect("ring SystemRandom failed")
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.0
            .fill(dest)
            // ring's error type here is empty/unspecified anyway, so the
            // specific code doesn't matter.
            .map_err(|_| rand_core::Error::from(RAND_ERROR_CODE))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = SysRng::new();
        assert_eq!(rng.gen_range(0), 0);
        for _ in 0..64 {
            assert!(rng.gen_range(10) < 10);
        }
    }
}
