//! Randomness Provider - Injectable Sampling
//!
//! Every random decision the engine makes goes through [`RandomSource`].
//! Any `rand::Rng` is a source, so callers pick between entropy-seeded
//! generators in production and `StdRng::seed_from_u64` in tests.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::pipeline::ResolveError;

pub trait RandomSource {
    /// Pick an index with probability proportional to its weight.
    fn pick_weighted(&mut self, weights: &[f64]) -> Result<usize, ResolveError>;

    /// Pick an index in `0..len` uniformly. `len` must be non-zero.
    fn pick_uniform(&mut self, len: usize) -> usize;

    /// Draw a float from the inclusive range `[low, high]`.
    fn draw_uniform(&mut self, low: f64, high: f64) -> f64;

    /// A fresh seed for the generation service, covering the full `u32` range.
    fn next_seed(&mut self) -> u32;
}

impl<R: Rng> RandomSource for R {
    fn pick_weighted(&mut self, weights: &[f64]) -> Result<usize, ResolveError> {
        let index = WeightedIndex::new(weights).map_err(|e| {
            ResolveError::Validation(format!("invalid weights {weights:?}: {e}"))
        })?;
        Ok(index.sample(self))
    }

    fn pick_uniform(&mut self, len: usize) -> usize {
        self.gen_range(0..len)
    }

    fn draw_uniform(&mut self, low: f64, high: f64) -> f64 {
        self.gen_range(low..=high)
    }

    fn next_seed(&mut self) -> u32 {
        self.gen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zero_weights_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = rng.pick_weighted(&[0.0, 0.0]).unwrap_err();
        assert!(matches!(err, ResolveError::Validation(_)));
    }

    #[test]
    fn test_zero_weight_never_picked() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            assert_eq!(rng.pick_weighted(&[0.0, 2.0, 0.0]).unwrap(), 1);
        }
    }

    #[test]
    fn test_draw_uniform_degenerate_range() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(rng.draw_uniform(0.5, 0.5), 0.5);
    }

    #[test]
    fn test_dyn_source_is_usable() {
        let mut rng = StdRng::seed_from_u64(11);
        let source: &mut dyn RandomSource = &mut rng;
        assert!(source.pick_uniform(3) < 3);
    }
}
