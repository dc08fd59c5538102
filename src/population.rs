//! Population synthesis
//!
//! Draws `N = round(Nsources(zmax))` sources from an evolution model. Every
//! source owns an independent ChaCha stream selected by its index, so the
//! population is identical for a given seed whatever the thread count.
//! Sources are generated in fixed-size batches and handed to a
//! [`SourceSink`] in index order; only running totals are kept.

use std::f64::consts::PI;

use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Poisson;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::evolution::EvolutionModel;
use crate::sampling::InverseCdf;
use crate::tables::interp;
use crate::{FiresongError, Result};

/// Point-source sensitivity of a neutrino telescope [GeV/cm^2.s]
pub const POINT_SOURCE_SENSITIVITY: f64 = 1e-9;

/// sin(declination) bin centres of the IceCube diffuse response.
pub const ICECUBE_SIN_DEC: [f64; 22] = [
    -0.075, -0.025, 0.025, 0.075, 0.125, 0.175, 0.225, 0.275, 0.325, 0.375, 0.425, 0.475, 0.525,
    0.575, 0.625, 0.675, 0.725, 0.775, 0.825, 0.875, 0.925, 0.975,
];

/// Expected >200 TeV events per 1e-8 GeV/cm^2.s of source flux.
pub const ICECUBE_RESPONSE: [f64; 22] = [
    105.896, 185.11, 177.775, 155.445, 133.492, 113.77, 99.8513, 87.4213, 76.7264, 63.8566,
    57.6465, 48.2527, 44.1256, 34.2095, 30.4975, 25.8617, 22.4174, 19.0691, 15.683, 9.20381,
    5.12658, 3.40891,
];

const RESPONSE_FLUX_SCALE: f64 = 1e-8;
const BATCH_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Source {
    pub declination_deg: f64,
    pub redshift: f64,
    /// Intrinsic luminosity [erg/s]
    pub luminosity: f64,
    /// E^2 dN/dE at 100 TeV [GeV/cm^2.s]
    pub flux: f64,
    /// Neutrino events seen by IceCube, when requested
    pub observed: Option<u64>,
}

/// Receives sources in index order.
pub trait SourceSink {
    fn write_source(&mut self, source: &Source) -> Result<()>;
}

impl SourceSink for Vec<Source> {
    fn write_source(&mut self, source: &Source) -> Result<()> {
        self.push(*source);
        Ok(())
    }
}

/// Run-level totals of a generated population.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Population {
    pub seed: u64,
    pub expected_sources: f64,
    pub n_sources: usize,
    /// Sum of source fluxes [GeV/cm^2.s]
    pub total_flux: f64,
    pub observed_events: u64,
    /// Fluxes at or above the point-source sensitivity, when requested
    pub point_source_fluxes: Vec<f64>,
}

impl Population {
    /// All-sky average E^2 dN/dE [GeV/cm^2.s.sr]
    pub fn diffuse_flux(&self) -> f64 {
        self.total_flux / (4.0 * PI)
    }
}

/// Seeded family of per-source random streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStreams {
    seed: u64,
}

impl SourceStreams {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Streams from a fresh random seed; log `seed()` to replay the run.
    pub fn from_entropy() -> Self {
        Self::new(rand::thread_rng().gen())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generator for the source or trial at `index`.
    pub fn stream(&self, index: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(index);
        rng
    }
}

/// IceCube events per 1e-8 GeV/cm^2.s at `sin_dec`; zero outside [-0.1, 1].
pub fn icecube_response(sin_dec: f64) -> f64 {
    if !(-0.1..=1.0).contains(&sin_dec) {
        return 0.0;
    }
    let first = ICECUBE_SIN_DEC[0];
    let last = ICECUBE_SIN_DEC[ICECUBE_SIN_DEC.len() - 1];
    interp(sin_dec.clamp(first, last), &ICECUBE_SIN_DEC, &ICECUBE_RESPONSE).unwrap_or(0.0)
}

/// Poisson-distributed event count for a source of `flux` at `sin_dec`.
pub fn observed_events<R: Rng + ?Sized>(sin_dec: f64, flux: f64, rng: &mut R) -> Result<u64> {
    let mean = icecube_response(sin_dec) * flux / RESPONSE_FLUX_SCALE;
    if !(mean > 0.0) {
        return Ok(0);
    }
    let poisson = Poisson::new(mean).map_err(|_| {
        FiresongError::InvalidConfig(format!("invalid Poisson mean {mean}"))
    })?;
    Ok(poisson.sample(rng) as u64)
}

/// Isotropic direction: returns (sin(dec), dec in degrees).
pub fn isotropic_declination<R: Rng + ?Sized>(rng: &mut R) -> (f64, f64) {
    let sin_dec: f64 = rng.gen_range(-1.0..1.0);
    (sin_dec, sin_dec.asin().to_degrees())
}

/// Draw one source. Uniforms are consumed as redshift, luminosity (evolving
/// models only), declination, then the Poisson count.
fn draw_source<R: Rng + ?Sized>(
    model: &EvolutionModel,
    redshifts: &InverseCdf,
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<Source> {
    let redshift = redshifts.sample(rng.gen::<f64>());
    let luminosity = model.sample_luminosity(redshift, rng)?;
    let flux = model.lumi2flux(luminosity, config.index, config.emin, config.emax, redshift);
    let (sin_dec, declination_deg) = isotropic_declination(rng);
    let observed = if config.observed_counts {
        Some(observed_events(sin_dec, flux, rng)?)
    } else {
        None
    };

    Ok(Source {
        declination_deg,
        redshift,
        luminosity,
        flux,
        observed,
    })
}

/// Generate the population described by `config` and stream it into `sink`.
///
/// Validates the configuration and prepares every lookup table before the
/// first draw.
pub fn generate_population<S: SourceSink>(
    model: &mut EvolutionModel,
    config: &SimulationConfig,
    streams: SourceStreams,
    sink: &mut S,
) -> Result<Population> {
    config.validate()?;
    if model.kind() != config.evolution {
        return Err(FiresongError::InvalidConfig(format!(
            "model {} does not match configured evolution {}",
            model.kind(),
            config.evolution
        )));
    }

    let redshift_grid = config.redshift_grid();
    let pdf: Vec<f64> = redshift_grid
        .par_iter()
        .map(|&z| model.redshift_distribution(z))
        .collect();
    let redshifts = InverseCdf::new(redshift_grid, &pdf)?;
    model.luminosity_cdf(redshifts.bins(), &config.luminosity_grid())?;

    let expected_sources = model.n_sources(config.zmax)?;
    let n_sources = expected_sources.round() as usize;
    model.normalize_flux(&redshifts, n_sources)?;
    info!(
        expected = expected_sources,
        n_sources,
        seed = streams.seed(),
        "sampling population"
    );

    let model: &EvolutionModel = model;
    let mut total_flux = 0.0;
    let mut observed_events = 0;
    let mut point_source_fluxes = Vec::new();

    let mut start = 0;
    while start < n_sources {
        let end = (start + BATCH_SIZE).min(n_sources);
        let batch = (start..end)
            .into_par_iter()
            .map(|index| {
                let mut rng = streams.stream(index as u64);
                draw_source(model, &redshifts, config, &mut rng)
            })
            .collect::<Result<Vec<Source>>>()?;

        for source in &batch {
            total_flux += source.flux;
            observed_events += source.observed.unwrap_or(0);
            if config.point_source_comparison && source.flux >= POINT_SOURCE_SENSITIVITY {
                point_source_fluxes.push(source.flux);
            }
            sink.write_source(source)?;
        }
        debug!(written = end, total = n_sources, "batch written");
        start = end;
    }

    let population = Population {
        seed: streams.seed(),
        expected_sources,
        n_sources,
        total_flux,
        observed_events,
        point_source_fluxes,
    };
    info!(
        total_flux = population.total_flux,
        diffuse_flux = population.diffuse_flux(),
        "population complete"
    );
    Ok(population)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvolutionKind;
    use approx::assert_relative_eq;

    fn small_config(evolution: EvolutionKind) -> SimulationConfig {
        // a few thousand sources
        SimulationConfig {
            evolution,
            zmax: 1.0,
            bins: 500,
            luminosity_bins: 100,
            density: 1e-9,
            ..SimulationConfig::default()
        }
    }

    fn run(config: &SimulationConfig, seed: u64) -> (Population, Vec<Source>) {
        let mut model = EvolutionModel::from_config(config).unwrap();
        let mut sources = Vec::new();
        let population =
            generate_population(&mut model, config, SourceStreams::new(seed), &mut sources)
                .unwrap();
        (population, sources)
    }

    #[test]
    fn same_seed_reproduces_population() {
        let config = small_config(EvolutionKind::Ha2014Bl);
        let (pa, a) = run(&config, 42);
        let (pb, b) = run(&config, 42);
        assert_eq!(a, b);
        assert_eq!(pa, pb);
        assert!(!a.is_empty());
    }

    #[test]
    fn different_seeds_differ() {
        let config = small_config(EvolutionKind::StandardCandle);
        let (_, a) = run(&config, 1);
        let (_, b) = run(&config, 2);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn population_does_not_depend_on_thread_count() {
        let config = small_config(EvolutionKind::Ha2014Bl);
        let (_, parallel) = run(&config, 17);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let (_, serial) = pool.install(|| run(&config, 17));
        assert_eq!(parallel, serial);
    }

    #[test]
    fn source_count_matches_expectation() {
        let config = small_config(EvolutionKind::StandardCandle);
        let (population, sources) = run(&config, 3);
        assert_eq!(population.n_sources, population.expected_sources.round() as usize);
        assert_eq!(sources.len(), population.n_sources);
    }

    #[test]
    fn totals_match_written_sources() {
        let config = SimulationConfig {
            point_source_comparison: true,
            ..small_config(EvolutionKind::Ha2014Bl)
        };
        let (population, sources) = run(&config, 5);
        let total: f64 = sources.iter().map(|s| s.flux).sum();
        assert_relative_eq!(population.total_flux, total, max_relative = 1e-12);
        let events: u64 = sources.iter().map(|s| s.observed.unwrap()).sum();
        assert_eq!(population.observed_events, events);
        let bright = sources
            .iter()
            .filter(|s| s.flux >= POINT_SOURCE_SENSITIVITY)
            .count();
        assert_eq!(population.point_source_fluxes.len(), bright);
        assert_relative_eq!(population.diffuse_flux(), total / (4.0 * PI));
    }

    #[test]
    fn sources_stay_in_range() {
        let config = small_config(EvolutionKind::Ha2014Bl);
        let (_, sources) = run(&config, 8);
        for s in &sources {
            assert!(s.redshift >= config.zmin && s.redshift < config.zmax);
            assert!((-90.0..=90.0).contains(&s.declination_deg));
            assert!(s.flux > 0.0);
        }
    }

    #[test]
    fn candle_expected_flux_equals_fluxnorm() {
        let config = small_config(EvolutionKind::StandardCandle);
        let mut model = EvolutionModel::from_config(&config).unwrap();
        let grid = config.redshift_grid();
        let pdf: Vec<f64> = grid.iter().map(|&z| model.redshift_distribution(z)).collect();
        let redshifts = InverseCdf::new(grid, &pdf).unwrap();
        let n = 1234;
        model.normalize_flux(&redshifts, n).unwrap();

        let EvolutionModel::StandardCandle(candle) = &model else {
            panic!("expected a standard candle");
        };
        let mean_flux: f64 = redshifts
            .bins()
            .iter()
            .zip(redshifts.normalized_pdf())
            .map(|(&z, p)| {
                p * model.lumi2flux(candle.luminosity, config.index, config.emin, config.emax, z)
            })
            .sum();
        assert_relative_eq!(
            n as f64 * mean_flux / (4.0 * PI),
            config.fluxnorm,
            max_relative = 1e-9
        );
    }

    #[test]
    fn candle_population_reproduces_diffuse_flux() {
        // away from z = 0 the summed flux is not dominated by a few nearby sources
        let config = SimulationConfig {
            zmin: 0.1,
            zmax: 2.0,
            density: 3e-9,
            observed_counts: false,
            ..small_config(EvolutionKind::StandardCandle)
        };
        for seed in 1..=3 {
            let (population, _) = run(&config, seed);
            assert!(population.n_sources > 10_000);
            assert_relative_eq!(population.diffuse_flux(), config.fluxnorm, max_relative = 0.1);
        }
    }

    #[test]
    fn evolving_model_keeps_its_flux_scale() {
        let config = small_config(EvolutionKind::Ha2014Bl);
        let mut model = EvolutionModel::from_config(&config).unwrap();
        let before = model.lumi2flux(1e45, config.index, config.emin, config.emax, 0.5);
        let redshifts = InverseCdf::new(vec![0.5], &[1.0]).unwrap();
        model.normalize_flux(&redshifts, 100).unwrap();
        assert_eq!(
            model.lumi2flux(1e45, config.index, config.emin, config.emax, 0.5),
            before
        );
    }

    #[test]
    fn observed_counts_can_be_disabled() {
        let config = SimulationConfig {
            observed_counts: false,
            ..small_config(EvolutionKind::StandardCandle)
        };
        let (population, sources) = run(&config, 9);
        assert!(sources.iter().all(|s| s.observed.is_none()));
        assert_eq!(population.observed_events, 0);
    }

    #[test]
    fn source_matches_its_indexed_stream() {
        let config = small_config(EvolutionKind::Ha2014Bl);
        let (_, sources) = run(&config, 21);

        let mut model = EvolutionModel::from_config(&config).unwrap();
        let grid = config.redshift_grid();
        let pdf: Vec<f64> = grid.iter().map(|&z| model.redshift_distribution(z)).collect();
        let redshifts = InverseCdf::new(grid, &pdf).unwrap();
        model
            .luminosity_cdf(redshifts.bins(), &config.luminosity_grid())
            .unwrap();

        let streams = SourceStreams::new(21);
        for index in [0usize, 7, sources.len() - 1] {
            let mut rng = streams.stream(index as u64);
            let expected = draw_source(&model, &redshifts, &config, &mut rng).unwrap();
            assert_eq!(sources[index], expected);
        }
    }

    #[test]
    fn mismatched_model_is_rejected() {
        let config = small_config(EvolutionKind::Ha2014Bl);
        let mut model =
            EvolutionModel::from_config(&small_config(EvolutionKind::StandardCandle)).unwrap();
        let mut sink = Vec::new();
        let result = generate_population(&mut model, &config, SourceStreams::new(1), &mut sink);
        assert!(result.is_err());
        assert!(sink.is_empty());
    }

    #[test]
    fn invalid_config_fails_before_sampling() {
        let config = SimulationConfig {
            zmin: 0.0,
            ..small_config(EvolutionKind::StandardCandle)
        };
        let mut model = EvolutionModel::from_config(&config).unwrap();
        let mut sink = Vec::new();
        let result = generate_population(&mut model, &config, SourceStreams::new(1), &mut sink);
        assert!(matches!(result, Err(FiresongError::InvalidConfig(_))));
        assert!(sink.is_empty());
    }

    #[test]
    fn declination_is_sine_uniform() {
        let mut rng = SourceStreams::new(99).stream(0);
        let n = 200_000;
        let mut sin_hist = [0usize; 10];
        let mut dec_hist = [0usize; 10];
        for _ in 0..n {
            let (sin_dec, dec) = isotropic_declination(&mut rng);
            sin_hist[(((sin_dec + 1.0) / 2.0 * 10.0) as usize).min(9)] += 1;
            dec_hist[(((dec + 90.0) / 180.0 * 10.0) as usize).min(9)] += 1;
        }
        let expected = n as f64 / 10.0;
        for count in sin_hist {
            assert_relative_eq!(count as f64, expected, max_relative = 0.03);
        }
        // equatorial bins hold far more sources than polar ones
        assert!(dec_hist[4] as f64 > 3.0 * dec_hist[0] as f64);
    }

    #[test]
    fn response_is_zero_outside_coverage() {
        assert_eq!(icecube_response(-0.5), 0.0);
        assert_eq!(icecube_response(1.01), 0.0);
        assert_relative_eq!(icecube_response(-0.1), ICECUBE_RESPONSE[0]);
        assert_relative_eq!(icecube_response(1.0), ICECUBE_RESPONSE[21]);
    }

    #[test]
    fn response_interpolates_between_bins() {
        assert_relative_eq!(icecube_response(0.025), 177.775);
        assert_relative_eq!(
            icecube_response(0.05),
            0.5 * (177.775 + 155.445),
            max_relative = 1e-12
        );
    }

    #[test]
    fn observed_events_follow_poisson_mean() {
        let mut rng = SourceStreams::new(4).stream(0);
        let n = 20_000;
        // mean = 63.8566 * 1e-9 / 1e-8
        let total: u64 = (0..n)
            .map(|_| observed_events(0.375, 1e-9, &mut rng).unwrap())
            .sum();
        assert_relative_eq!(total as f64 / n as f64, 6.38566, max_relative = 0.02);
        assert_eq!(observed_events(-0.5, 1e-9, &mut rng).unwrap(), 0);
    }

    #[test]
    fn streams_are_independent_per_index() {
        let streams = SourceStreams::new(10);
        let a: f64 = streams.stream(0).gen();
        let b: f64 = streams.stream(1).gen();
        assert_ne!(a, b);
        assert_eq!(a, streams.stream(0).gen::<f64>());
    }
}
