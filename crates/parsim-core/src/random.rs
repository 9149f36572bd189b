//! Deterministic random streams for model behavior.
//!
//! A [`LehmerStream`] is a Park–Miller multiplicative congruential generator:
//! small, fast, and stable across platforms and releases, which is what makes
//! two identically-seeded runs reproduce the same event sequence. It
//! implements [`RngCore`]/[`SeedableRng`] so models can also drive the `rand`
//! API surface from it, and carries the distribution helpers simulation
//! models actually use.

use rand::{RngCore, SeedableRng};

const MODULUS: i64 = 2_147_483_647; // 2^31 - 1
const MULTIPLIER: i64 = 48_271;

/// A deterministic Lehmer random stream.
#[derive(Debug, Clone)]
pub struct LehmerStream {
    state: i64,
}

impl LehmerStream {
    /// Create a stream from a seed. Any value is accepted; it is folded into
    /// the generator's nonzero state range.
    pub fn new(seed: u64) -> Self {
        let folded = (seed % (MODULUS as u64 - 1)) as i64 + 1;
        LehmerStream { state: folded }
    }

    /// Next raw value in `[1, MODULUS)`.
    fn draw(&mut self) -> i64 {
        // Schrage's method: avoids overflow without widening.
        const Q: i64 = MODULUS / MULTIPLIER;
        const R: i64 = MODULUS % MULTIPLIER;
        let t = MULTIPLIER * (self.state % Q) - R * (self.state / Q);
        self.state = if t > 0 { t } else { t + MODULUS };
        self.state
    }

    /// Uniform draw in the open interval `(0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.draw() as f64 / MODULUS as f64
    }

    /// Exponentially distributed draw with the given rate (mean `1/rate`).
    pub fn exponential(&mut self, rate: f64) -> f64 {
        -(1.0 - self.uniform()).ln() / rate
    }

    /// Poisson distributed draw with the given mean.
    pub fn poisson(&mut self, mean: f64) -> u64 {
        if mean <= 0.0 {
            return 0;
        }
        let threshold = (-mean).exp();
        let mut count = 0u64;
        let mut product = self.uniform();
        while product > threshold {
            count += 1;
            product *= self.uniform();
        }
        count
    }

    /// Uniform integer draw in the inclusive range `[low, high]`.
    pub fn equilikely(&mut self, low: i64, high: i64) -> i64 {
        debug_assert!(low <= high);
        low + ((high - low + 1) as f64 * self.uniform()) as i64
    }
}

impl RngCore for LehmerStream {
    fn next_u32(&mut self) -> u32 {
        // Two draws of ~31 bits each; take 16 high-entropy bits from each.
        let hi = (self.draw() >> 15) as u32 & 0xffff;
        let lo = (self.draw() >> 15) as u32 & 0xffff;
        (hi << 16) | lo
    }

    fn next_u64(&mut self) -> u64 {
        ((self.next_u32() as u64) << 32) | self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

impl SeedableRng for LehmerStream {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        LehmerStream::new(u64::from_le_bytes(seed))
    }
}
