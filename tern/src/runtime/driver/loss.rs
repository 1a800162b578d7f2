//! Simulated packet loss for testing lossy networks.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded Bernoulli drop decision. Endpoints consult it per frame.
#[derive(Debug, Clone)]
pub struct LossGenerator {
    rate: f64,
    rng: StdRng,
}

impl LossGenerator {
    /// `seed == -1` draws the seed from entropy.
    #[must_use]
    pub fn new(rate: f64, seed: i64) -> Self {
        let rng = if seed == -1 {
            StdRng::from_os_rng()
        } else {
            StdRng::seed_from_u64(seed as u64)
        };
        Self {
            rate: if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) },
            rng,
        }
    }

    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }

    /// `true` when the frame should be dropped.
    pub fn should_drop_frame(&mut self) -> bool {
        self.rate > 0.0 && self.rng.random_bool(self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_never_drops() {
        let mut loss = LossGenerator::new(0.0, 1);
        assert!((0..1000).all(|_| !loss.should_drop_frame()));
    }

    #[test]
    fn full_rate_always_drops() {
        let mut loss = LossGenerator::new(1.0, -1);
        assert!((0..1000).all(|_| loss.should_drop_frame()));
    }

    #[test]
    fn same_seed_same_decisions() {
        let mut a = LossGenerator::new(0.3, 42);
        let mut b = LossGenerator::new(0.3, 42);
        let da: Vec<bool> = (0..256).map(|_| a.should_drop_frame()).collect();
        let db: Vec<bool> = (0..256).map(|_| b.should_drop_frame()).collect();
        assert_eq!(da, db);
        assert!(da.iter().any(|d| *d));
        assert!(da.iter().any(|d| !*d));
    }
}
