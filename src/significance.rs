//! Detection significance of a simulated source
//!
//! Two statistics are computed from the same signal and background counts:
//! the Gaussian approximation `S / sqrt(B)` and the Li & Ma (1983, eq. 17)
//! likelihood ratio for an on/off measurement. Transient sources only
//! contribute signal during the part of their flare the telescope catches
//! after the alert and slew delay.

use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::SensitivityConfig;
use crate::population::SourceStreams;
use crate::spectrum::{FluxConvention, SpectralIntegrator};
use crate::tables::BackgroundRate;
use crate::{FiresongError, Result};

/// Outcome of the Li & Ma statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum LiMaSignificance {
    Valid(f64),
    /// No excess to test: zero signal, zero background or zero on-counts
    Undefined,
    /// Negative on-counts, non-positive alpha or a negative log-likelihood ratio
    Invalid,
}

impl LiMaSignificance {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Valid(v) => Some(*v),
            Self::Undefined | Self::Invalid => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Numeric encoding for tabular output: the value, 0 or -1.
    pub fn as_sentinel(&self) -> f64 {
        match self {
            Self::Valid(v) => *v,
            Self::Undefined => 0.0,
            Self::Invalid => -1.0,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Valid(_) => "valid",
            Self::Undefined => "undefined",
            Self::Invalid => "invalid",
        }
    }
}

/// Li & Ma eq. 17 with `n_on = signal + background` and
/// `n_off = background / alpha`.
pub fn li_ma_significance(signal: f64, background: f64, alpha: f64) -> LiMaSignificance {
    let n_on = signal + background;
    if signal == 0.0 || background == 0.0 || n_on == 0.0 {
        return LiMaSignificance::Undefined;
    }
    if n_on < 0.0 || alpha <= 0.0 {
        return LiMaSignificance::Invalid;
    }

    let n_off = background / alpha;
    let l = n_on * (n_on / (n_on + n_off) * (alpha + 1.0) / alpha).ln();
    let m = n_off * ((alpha + 1.0) * n_off / (n_on + n_off)).ln();
    let sum = l + m;
    if !sum.is_finite() || sum < 0.0 {
        return LiMaSignificance::Invalid;
    }
    LiMaSignificance::Valid((2.0 * sum).sqrt())
}

/// `signal / sqrt(background)`, 0 when there is no background.
pub fn gaussian_significance(signal: f64, background: f64) -> f64 {
    if background <= 0.0 {
        return 0.0;
    }
    signal / background.sqrt()
}

/// Alert generation plus telescope repositioning [s]: (20 + U(0, 60)) + (20 + U(0, 30)).
pub fn repositioning_delay(u_alert: f64, u_slew: f64) -> f64 {
    (20.0 + u_alert * 60.0) + (20.0 + u_slew * 30.0)
}

/// Usable flare time after the delay, clamped to [0, window].
pub fn clamp_duration(raw_duration: f64, delay: f64, window: f64) -> f64 {
    (raw_duration - delay).clamp(0.0, window)
}

/// Randomly timed flare of a transient source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransientTiming {
    /// Intrinsic flare duration scale [s]
    pub timescale_s: f64,
    /// Observation window [s]
    pub observation_window_s: f64,
}

impl TransientTiming {
    pub fn new(timescale_s: f64, observation_window_s: f64) -> Result<Self> {
        if !(timescale_s > 0.0) || !(observation_window_s > 0.0) {
            return Err(FiresongError::InvalidConfig(format!(
                "transient timescale ({timescale_s}) and window ({observation_window_s}) must be > 0"
            )));
        }
        Ok(Self {
            timescale_s,
            observation_window_s,
        })
    }

    /// Observed duration of one flare at redshift `z`.
    ///
    /// Draws three uniforms in order: the emission time within the
    /// time-dilated flare, then the alert and slew parts of the delay.
    pub fn draw_event_duration<R: Rng + ?Sized>(&self, redshift: f64, rng: &mut R) -> f64 {
        let raw = rng.gen::<f64>() * self.timescale_s * (1.0 + redshift);
        let delay = repositioning_delay(rng.gen::<f64>(), rng.gen::<f64>());
        clamp_duration(raw, delay, self.observation_window_s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignificanceResult {
    /// Signal integration time [s]
    pub event_duration: f64,
    pub li_ma: LiMaSignificance,
    pub gaussian: f64,
    pub signal_counts: f64,
    pub background_counts: f64,
}

/// Per-trial significance for one instrument configuration.
#[derive(Debug, Clone)]
pub struct SignificanceEvaluator {
    integrator: SpectralIntegrator,
    background_counts: f64,
    alpha: f64,
    index: f64,
    convention: FluxConvention,
    observation_window_s: f64,
    transient: Option<TransientTiming>,
}

impl SignificanceEvaluator {
    pub fn new(
        integrator: SpectralIntegrator,
        background: &BackgroundRate,
        config: &SensitivityConfig,
    ) -> Result<Self> {
        config.validate()?;
        let observation_window_s = config.observation_window();
        let transient = if config.transient {
            Some(TransientTiming::new(config.timescale, observation_window_s)?)
        } else {
            None
        };

        Ok(Self {
            integrator,
            background_counts: background.counts(config.obs_time_hours),
            alpha: config.alpha,
            index: config.index,
            convention: config.convention,
            observation_window_s,
            transient,
        })
    }

    pub fn background_counts(&self) -> f64 {
        self.background_counts
    }

    pub fn is_transient(&self) -> bool {
        self.transient.is_some()
    }

    /// Significance of a source with normalization `fluxnorm` at `redshift`.
    ///
    /// Steady sources integrate over the full window and draw nothing;
    /// transients draw their duration once per trial.
    pub fn evaluate<R: Rng + ?Sized>(
        &self,
        fluxnorm: f64,
        redshift: f64,
        rng: &mut R,
    ) -> SignificanceResult {
        let event_duration = match &self.transient {
            Some(timing) => timing.draw_event_duration(redshift, rng),
            None => self.observation_window_s,
        };

        let signal_counts = self.integrator.expected_counts(
            self.convention,
            fluxnorm,
            self.index,
            redshift,
            event_duration,
        );

        SignificanceResult {
            event_duration,
            li_ma: li_ma_significance(signal_counts, self.background_counts, self.alpha),
            gaussian: gaussian_significance(signal_counts, self.background_counts),
            signal_counts,
            background_counts: self.background_counts,
        }
    }
}

/// Evaluate `(fluxnorm, redshift)` trials in parallel; trial `i` draws
/// from stream `i`, so results do not depend on the thread count.
pub fn evaluate_trials(
    evaluator: &SignificanceEvaluator,
    trials: &[(f64, f64)],
    streams: SourceStreams,
) -> Vec<SignificanceResult> {
    trials
        .par_iter()
        .enumerate()
        .map(|(index, &(fluxnorm, redshift))| {
            let mut rng = streams.stream(index as u64);
            evaluator.evaluate(fluxnorm, redshift, &mut rng)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{EffectiveArea, TabulatedFunction};
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn evaluator(transient: bool) -> SignificanceEvaluator {
        let area = EffectiveArea::from_table(
            &TabulatedFunction::parse("0.1 1e4\n1.0 1e5\n10.0 1e5\n", "area").unwrap(),
        )
        .unwrap();
        let bkg =
            BackgroundRate::from_table(&TabulatedFunction::parse("0 1 0.1\n1 2 0.2\n", "bkg").unwrap())
                .unwrap();
        let config = SensitivityConfig {
            transient,
            ebl: None,
            ..SensitivityConfig::default()
        };
        SignificanceEvaluator::new(SpectralIntegrator::new(&area, None).unwrap(), &bkg, &config)
            .unwrap()
    }

    #[test]
    fn no_excess_is_undefined() {
        assert_eq!(li_ma_significance(0.0, 5.0, 1.0), LiMaSignificance::Undefined);
        assert_eq!(li_ma_significance(5.0, 0.0, 1.0), LiMaSignificance::Undefined);
        assert_eq!(li_ma_significance(-5.0, 5.0, 1.0), LiMaSignificance::Undefined);
        assert_eq!(li_ma_significance(0.0, 5.0, 1.0).as_sentinel(), 0.0);
    }

    #[test]
    fn negative_on_counts_and_bad_alpha_are_invalid() {
        assert_eq!(li_ma_significance(-8.0, 5.0, 1.0), LiMaSignificance::Invalid);
        assert_eq!(li_ma_significance(5.0, 5.0, 0.0), LiMaSignificance::Invalid);
        assert_eq!(li_ma_significance(5.0, 5.0, -1.0).as_sentinel(), -1.0);
    }

    #[test]
    fn deficit_with_positive_on_counts_is_evaluated() {
        // n_on = 4, n_off = 5
        let sig = li_ma_significance(-1.0, 5.0, 1.0);
        let l = 4.0 * (4.0f64 / 9.0 * 2.0).ln();
        let m = 5.0 * (10.0f64 / 9.0).ln();
        assert_relative_eq!(sig.value().unwrap(), (2.0 * (l + m)).sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn equal_on_off_reference_value() {
        // L = 20 ln(4/3), M = 10 ln(2/3)
        let sig = li_ma_significance(10.0, 10.0, 1.0);
        assert!(sig.is_valid());
        assert_relative_eq!(sig.value().unwrap(), 1.8433, epsilon = 1e-4);
    }

    #[test]
    fn li_ma_approaches_gaussian_for_well_known_background() {
        let s = 100.0;
        let b = 1e6;
        let li_ma = li_ma_significance(s, b, 1e-3).value().unwrap();
        assert_relative_eq!(li_ma, gaussian_significance(s, b), max_relative = 0.01);
    }

    #[test]
    fn gaussian_without_background_is_zero() {
        assert_eq!(gaussian_significance(10.0, 0.0), 0.0);
        assert_relative_eq!(gaussian_significance(10.0, 25.0), 2.0);
    }

    #[test]
    fn delay_bounds() {
        assert_relative_eq!(repositioning_delay(0.0, 0.0), 40.0);
        assert_relative_eq!(repositioning_delay(1.0, 1.0), 130.0);
    }

    #[test]
    fn duration_shorter_than_delay_is_zero() {
        assert_eq!(clamp_duration(50.0, 60.0, 18_000.0), 0.0);
    }

    #[test]
    fn duration_longer_than_window_is_clamped() {
        assert_eq!(clamp_duration(40_000.0, 60.0, 18_000.0), 18_000.0);
        assert_relative_eq!(clamp_duration(1000.0, 60.0, 18_000.0), 940.0);
    }

    #[test]
    fn transient_draw_stays_in_window() {
        let timing = TransientTiming::new(1e6, 3600.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..1000 {
            let d = timing.draw_event_duration(2.0, &mut rng);
            assert!((0.0..=3600.0).contains(&d));
        }
    }

    #[test]
    fn transient_draw_uses_three_uniforms() {
        let timing = TransientTiming::new(1000.0, 18_000.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let mut replay = rng.clone();
        let d = timing.draw_event_duration(0.5, &mut rng);
        let (u1, u2, u3): (f64, f64, f64) = (replay.gen(), replay.gen(), replay.gen());
        let expected = clamp_duration(u1 * 1000.0 * 1.5, repositioning_delay(u2, u3), 18_000.0);
        assert_eq!(d, expected);
        assert_eq!(rng.gen::<u64>(), replay.gen::<u64>());
    }

    #[test]
    fn steady_source_uses_full_window() {
        let eval = evaluator(false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = eval.evaluate(1e-8, 0.1, &mut rng);
        assert_eq!(result.event_duration, 5.0 * 3600.0);
        assert_relative_eq!(result.background_counts, 0.3 * 3600.0 * 5.0, max_relative = 1e-12);
        assert!(result.signal_counts > 0.0);
        assert_relative_eq!(
            result.gaussian,
            result.signal_counts / result.background_counts.sqrt(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn transient_trials_are_reproducible() {
        let eval = evaluator(true);
        assert!(eval.is_transient());
        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..50)
                .map(|_| eval.evaluate(1e-8, 0.2, &mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(4), run(4));
    }

    #[test]
    fn trial_batches_use_indexed_streams() {
        let eval = evaluator(true);
        let trials = [(1e-8, 0.1), (1e-9, 0.5), (1e-8, 1.0)];
        let streams = SourceStreams::new(12);
        let batch = evaluate_trials(&eval, &trials, streams);
        for (index, &(fluxnorm, z)) in trials.iter().enumerate() {
            let mut rng = streams.stream(index as u64);
            assert_eq!(batch[index], eval.evaluate(fluxnorm, z, &mut rng));
        }
    }

    #[test]
    fn brighter_sources_are_more_significant() {
        let eval = evaluator(false);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let faint = eval.evaluate(1e-10, 0.1, &mut rng);
        let bright = eval.evaluate(1e-8, 0.1, &mut rng);
        assert!(bright.gaussian > faint.gaussian);
        assert!(bright.li_ma.value().unwrap() > faint.li_ma.value().unwrap());
    }

    proptest! {
        #[test]
        fn gaussian_is_monotone(s in 0.0f64..1e4, ds in 0.01f64..1e3, b in 0.1f64..1e5, db in 0.01f64..1e3) {
            prop_assert!(gaussian_significance(s + ds, b) > gaussian_significance(s, b));
            if s > 0.0 {
                prop_assert!(gaussian_significance(s, b + db) < gaussian_significance(s, b));
            }
        }

        #[test]
        fn li_ma_is_valid_for_positive_counts(s in 1.0f64..1e4, b in 1.0f64..1e5, alpha in 0.05f64..5.0) {
            let sig = li_ma_significance(s, b, alpha);
            prop_assert!(sig.is_valid());
            prop_assert!(sig.as_sentinel() >= 0.0);
        }
    }
}
