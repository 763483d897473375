//! Heap-profile sample thresholds
//!
//! The gap between samples is drawn from an exponential distribution with
//! mean `rate`, so sampling is a Poisson process over allocated bytes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Cap on a single draw, keeps a freak draw from disabling sampling.
const MAX_GAP: f64 = 0x700_0000 as f64;

pub struct Sampler {
    rate: usize,
    rng: StdRng,
}

impl Sampler {
    pub fn new(rate: usize) -> Self {
        Self::with_rng(rate, StdRng::from_os_rng())
    }

    /// Deterministic sampler for tests and benchmarks.
    pub fn seeded(rate: usize, seed: u64) -> Self {
        Self::with_rng(rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(rate: usize, rng: StdRng) -> Self {
        Self { rate, rng }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.rate > 0
    }

    #[inline]
    pub fn rate(&self) -> usize {
        self.rate
    }

    /// Bytes until the next sample.
    pub fn next_gap(&mut self) -> i32 {
        match self.rate {
            0 => i32::MAX,
            1 => 0,
            rate => {
                let u: f64 = self.rng.random_range(f64::EPSILON..1.0);
                (-u.ln() * rate as f64).min(MAX_GAP) as i32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_samples() {
        let mut sampler = Sampler::seeded(0, 1);
        assert!(!sampler.enabled());
        assert_eq!(sampler.next_gap(), i32::MAX);
    }

    #[test]
    fn rate_one_samples_everything() {
        let mut sampler = Sampler::seeded(1, 1);
        assert_eq!(sampler.next_gap(), 0);
    }

    #[test]
    fn draws_average_to_rate() {
        let rate = 4096;
        let mut sampler = Sampler::seeded(rate, 42);
        let n = 20_000;
        let total: i64 = (0..n).map(|_| sampler.next_gap() as i64).sum();
        let mean = total as f64 / n as f64;
        assert!(
            (mean - rate as f64).abs() < rate as f64 * 0.05,
            "mean gap {} too far from {}",
            mean,
            rate
        );
    }

    #[test]
    fn draws_are_bounded() {
        let mut sampler = Sampler::seeded(i32::MAX as usize, 7);
        for _ in 0..1000 {
            let gap = sampler.next_gap();
            assert!(gap >= 0 && gap as f64 <= MAX_GAP);
        }
    }
}
