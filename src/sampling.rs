//! Inverse-CDF sampling of empirical distributions
//!
//! Builds a normalized cumulative distribution from a density sampled on a
//! grid and maps uniform variates back onto the grid. The inversion is
//! piecewise constant: a variate `u` lands on the first grid value whose
//! cumulative probability is at least `u`, with no interpolation between
//! neighbouring grid points.

use crate::{FiresongError, Result};

/// Inverse cumulative distribution over a fixed grid.
#[derive(Debug, Clone, PartialEq)]
pub struct InverseCdf {
    /// Domain grid values
    bins: Vec<f64>,
    /// Normalized cumulative sum of the density, last entry is 1
    cdf: Vec<f64>,
}

impl InverseCdf {
    /// Build the sampler from a grid and a matching non-negative density.
    ///
    /// # Errors
    /// * `LengthMismatch` if `pdf` and `bins` differ in length
    /// * `InvalidConfig` if the grid is empty or a density value is negative or not finite
    /// * `DivisionByZero` if the density sums to zero
    pub fn new(bins: Vec<f64>, pdf: &[f64]) -> Result<Self> {
        if bins.is_empty() {
            return Err(FiresongError::InvalidConfig(
                "inverse CDF grid must not be empty".to_string(),
            ));
        }
        if bins.len() != pdf.len() {
            return Err(FiresongError::LengthMismatch {
                context: "inverse CDF pdf",
                expected: bins.len(),
                got: pdf.len(),
            });
        }
        if pdf.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(FiresongError::InvalidConfig(
                "density values must be finite and non-negative".to_string(),
            ));
        }

        let cdf = cumulative(pdf)?;
        Ok(Self { bins, cdf })
    }

    /// Map one uniform variate in [0, 1) onto the grid.
    pub fn sample(&self, u: f64) -> f64 {
        self.bins[self.index_of(u)]
    }

    /// Map a batch of uniform variates, preserving order.
    pub fn sample_many(&self, us: &[f64]) -> Vec<f64> {
        us.iter().map(|&u| self.sample(u)).collect()
    }

    /// Index of the first CDF entry that is >= `u`.
    pub fn index_of(&self, u: f64) -> usize {
        first_at_least(&self.cdf, u)
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    pub fn cdf(&self) -> &[f64] {
        &self.cdf
    }

    /// Normalized density recovered by differencing adjacent CDF entries.
    pub fn normalized_pdf(&self) -> Vec<f64> {
        let mut previous = 0.0;
        self.cdf
            .iter()
            .map(|&c| {
                let p = c - previous;
                previous = c;
                p
            })
            .collect()
    }
}

/// Cumulative sum of `pdf` normalized by its final value.
pub fn cumulative(pdf: &[f64]) -> Result<Vec<f64>> {
    let mut running = 0.0;
    let mut cdf: Vec<f64> = pdf
        .iter()
        .map(|p| {
            running += p;
            running
        })
        .collect();

    if running <= 0.0 {
        return Err(FiresongError::DivisionByZero {
            context: "density sums to zero",
        });
    }
    for c in cdf.iter_mut() {
        *c /= running;
    }
    Ok(cdf)
}

/// Lower-bound search: first index whose CDF value is >= `u`, clamped to the
/// last index. `cdf` must be non-empty.
pub fn first_at_least(cdf: &[f64], u: f64) -> usize {
    cdf.partition_point(|&c| c < u).min(cdf.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn grid(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * 0.5).collect()
    }

    #[test]
    fn zero_maps_to_first_bin() {
        let sampler = InverseCdf::new(grid(4), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(sampler.sample(0.0), 0.0);
    }

    #[test]
    fn just_below_one_maps_to_last_bin() {
        let sampler = InverseCdf::new(grid(4), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(sampler.sample(1.0 - 1e-12), 1.5);
    }

    #[test]
    fn exact_cdf_value_picks_smallest_index() {
        // cdf = [0.25, 0.5, 0.5, 1.0]
        let sampler = InverseCdf::new(grid(4), &[1.0, 1.0, 0.0, 2.0]).unwrap();
        assert_eq!(sampler.index_of(0.5), 1);
        assert_eq!(sampler.index_of(0.25), 0);
        assert_eq!(sampler.index_of(0.2500001), 1);
        assert_eq!(sampler.index_of(0.5000001), 3);
    }

    #[test]
    fn zero_density_is_rejected() {
        let err = InverseCdf::new(grid(3), &[0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, FiresongError::DivisionByZero { .. }));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = InverseCdf::new(grid(3), &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, FiresongError::LengthMismatch { .. }));
    }

    #[test]
    fn empty_grid_is_rejected() {
        assert!(InverseCdf::new(Vec::new(), &[]).is_err());
    }

    #[test]
    fn batch_matches_scalar_calls() {
        let sampler = InverseCdf::new(grid(5), &[0.1, 0.4, 0.2, 0.2, 0.1]).unwrap();
        let us = [0.05, 0.95, 0.3, 0.61, 0.0];
        let batch = sampler.sample_many(&us);
        let scalar: Vec<f64> = us.iter().map(|&u| sampler.sample(u)).collect();
        assert_eq!(batch, scalar);
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let sampler = InverseCdf::new(grid(50), &vec![1.0; 50]).unwrap();
        let draw = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..1000)
                .map(|_| sampler.sample(rng.gen::<f64>()))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
    }

    #[test]
    fn empirical_frequencies_follow_density() {
        let sampler = InverseCdf::new(vec![0.0, 1.0], &[1.0, 3.0]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let n = 100_000;
        let ones = (0..n)
            .filter(|_| sampler.sample(rng.gen::<f64>()) == 1.0)
            .count();
        assert_relative_eq!(ones as f64 / n as f64, 0.75, epsilon = 0.01);
    }

    proptest! {
        #[test]
        fn differenced_cdf_reconstructs_pdf(pdf in prop::collection::vec(0.0f64..10.0, 1..64)) {
            prop_assume!(pdf.iter().sum::<f64>() > 1e-6);
            let bins = grid(pdf.len());
            let sampler = InverseCdf::new(bins, &pdf).unwrap();
            let total: f64 = pdf.iter().sum();
            for (recovered, original) in sampler.normalized_pdf().iter().zip(pdf.iter()) {
                prop_assert!((recovered - original / total).abs() < 1e-9);
            }
        }

        #[test]
        fn cdf_is_monotone_and_ends_at_one(pdf in prop::collection::vec(0.0f64..10.0, 1..64)) {
            prop_assume!(pdf.iter().sum::<f64>() > 1e-6);
            let sampler = InverseCdf::new(grid(pdf.len()), &pdf).unwrap();
            let cdf = sampler.cdf();
            prop_assert!(cdf.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!((cdf[cdf.len() - 1] - 1.0).abs() < 1e-12);
        }

        #[test]
        fn samples_stay_on_grid(u in 0.0f64..1.0) {
            let bins = grid(10);
            let sampler = InverseCdf::new(bins.clone(), &[1.0; 10]).unwrap();
            prop_assert!(bins.contains(&sampler.sample(u)));
        }
    }
}
