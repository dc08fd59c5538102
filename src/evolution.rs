//! Source density and luminosity evolution over cosmic redshift
//!
//! Every model shares the same density law: sources trace the cosmic star
//! formation history, so the number of sources per unit redshift over the
//! full sky is `4 pi SFH(log10(1 + z)) dV_c/dz`. Models differ in how they
//! assign intrinsic luminosity and convert it to an observed flux.

use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{EvolutionKind, SimulationConfig};
use crate::cosmology::{Cosmology, MPC_TO_CM};
use crate::sampling::{cumulative, first_at_least, InverseCdf};
use crate::{FiresongError, Result};

/// Lower breakpoint of the star formation history in log10(1 + z)
pub const SFH_BREAK_LOW: f64 = 0.30963;
/// Upper breakpoint of the star formation history in log10(1 + z)
pub const SFH_BREAK_HIGH: f64 = 0.73878;

/// erg in GeV
pub const ERG_TO_GEV: f64 = 624.151;
/// Pivot energy of the E^2 dN/dE normalization, 100 TeV in GeV
pub const PIVOT_ENERGY_GEV: f64 = 1e5;

/// Reference standard-candle flux at z = 1 [GeV/cm^2.s] for a local density
/// of 1e-6 Mpc^-3 and a diffuse flux of 1e-8 GeV/cm^2.s.sr. Replaced by
/// [`StandardCandle::normalize`] once the sampled population is known.
const CANDLE_FLUX_Z1: f64 = 2.20e-14;
const CANDLE_REFERENCE_DENSITY: f64 = 1e-6;
const CANDLE_REFERENCE_FLUXNORM: f64 = 1e-8;

const QUADRATURE_STEP: f64 = 5e-4;

/// Hopkins & Beacom star formation history [M_sun/yr/Mpc^3] at x = log10(1 + z).
pub fn star_formation_history(x: f64) -> f64 {
    if x < SFH_BREAK_LOW {
        10f64.powf(3.28 * x - 1.82)
    } else if x < SFH_BREAK_HIGH {
        10f64.powf(-0.26 * x - 0.724)
    } else {
        10f64.powf(-8.0 * x + 4.99)
    }
}

/// Full-sky source formation rate density per unit redshift.
pub fn sfh_redshift_distribution(cosmology: &Cosmology, z: f64) -> f64 {
    4.0 * std::f64::consts::PI
        * star_formation_history((1.0 + z).log10())
        * cosmology.diff_comoving_volume(z)
}

/// Expected number of sources in [0, zmax) for a local density [Mpc^-3].
fn sfh_source_count(cosmology: &Cosmology, density: f64, zmax: f64) -> f64 {
    let integral = simpson(|z| sfh_redshift_distribution(cosmology, z), 0.0, zmax);
    integral * density / star_formation_history(0.0)
}

/// Composite Simpson rule with a fixed step.
fn simpson(f: impl Fn(f64) -> f64, a: f64, b: f64) -> f64 {
    let mut n = ((b - a) / QUADRATURE_STEP).ceil() as usize;
    n = n.max(2);
    if n % 2 == 1 {
        n += 1;
    }
    let h = (b - a) / n as f64;
    let interior: f64 = (1..n)
        .map(|i| {
            let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
            weight * f(a + i as f64 * h)
        })
        .sum();
    (f(a) + interior + f(b)) * h / 3.0
}

/// E^2 dN/dE at 100 TeV [GeV/cm^2.s] of a source with luminosity `luminosity`
/// [erg/s] emitted between `emin` and `emax` [GeV] with spectral `index`.
pub fn luminosity_to_flux(
    cosmology: &Cosmology,
    luminosity: f64,
    index: f64,
    emin: f64,
    emax: f64,
    z: f64,
) -> f64 {
    let dl_cm = cosmology.luminosity_distance(z) * MPC_TO_CM;
    let k_correction = (1.0 + z).powf(2.0 - index);
    luminosity * ERG_TO_GEV * k_correction
        / (4.0 * std::f64::consts::PI * dl_cm * dl_cm * spectral_integral(index, emin, emax))
}

/// Integral of (E / 100 TeV)^(2 - index) dE/E over [emin, emax].
fn spectral_integral(index: f64, emin: f64, emax: f64) -> f64 {
    let delta = 2.0 - index;
    if delta.abs() < 1e-9 {
        (emax / emin).ln()
    } else {
        (emax.powf(delta) - emin.powf(delta)) / (delta * PIVOT_ENERGY_GEV.powf(delta))
    }
}

/// Luminosity-dependent density evolution fit for BL Lac objects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LddeParameters {
    pub gamma1: f64,
    pub gamma2: f64,
    /// Break luminosity [erg/s]
    pub lstar: f64,
    pub zc_star: f64,
    pub alpha: f64,
    pub p1_star: f64,
    pub tau: f64,
    pub p2: f64,
}

impl LddeParameters {
    pub fn ha2014_bl() -> Self {
        Self {
            gamma1: 0.27,
            gamma2: 1.86,
            lstar: 0.28e48,
            zc_star: 1.34,
            alpha: 4.53e-2,
            p1_star: 2.24,
            tau: 4.92,
            p2: -7.37,
        }
    }

    /// Unnormalized dN / (dlog10 L dV) at log10 luminosity `log_l` and redshift `z`.
    pub fn density(&self, log_l: f64, z: f64) -> f64 {
        let l = 10f64.powf(log_l);
        let ratio = l / self.lstar;
        let local = 1.0 / (ratio.powf(self.gamma1) + ratio.powf(self.gamma2));

        let zc = self.zc_star * (l / 1e48).powf(self.alpha);
        let p1 = self.p1_star + self.tau * (log_l - 46.0);
        let x = (1.0 + z) / (1.0 + zc);
        let evolution = 1.0 / (x.powf(-p1) + x.powf(-self.p2));

        local * evolution
    }
}

/// Per-redshift luminosity CDFs on a shared log10 luminosity grid.
#[derive(Debug, Clone, PartialEq)]
pub struct LuminosityCdfTable {
    redshifts: Vec<f64>,
    log_luminosities: Vec<f64>,
    rows: Vec<Vec<f64>>,
}

impl LuminosityCdfTable {
    pub fn build(
        lf: &LddeParameters,
        redshift_grid: &[f64],
        luminosity_grid: &[f64],
    ) -> Result<Self> {
        if redshift_grid.is_empty() || luminosity_grid.is_empty() {
            return Err(FiresongError::InvalidConfig(
                "redshift and luminosity grids must not be empty".to_string(),
            ));
        }

        let rows = redshift_grid
            .par_iter()
            .map(|&z| {
                let pdf: Vec<f64> = luminosity_grid
                    .iter()
                    .map(|&log_l| lf.density(log_l, z))
                    .collect();
                cumulative(&pdf)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            redshifts: redshift_grid.to_vec(),
            log_luminosities: luminosity_grid.to_vec(),
            rows,
        })
    }

    /// Luminosity [erg/s] for uniform variate `u` at the grid redshift at or below `z`.
    pub fn sample(&self, z: f64, u: f64) -> f64 {
        let row = self
            .redshifts
            .partition_point(|&g| g <= z)
            .saturating_sub(1);
        let idx = first_at_least(&self.rows[row], u);
        10f64.powf(self.log_luminosities[idx])
    }

    pub fn n_redshifts(&self) -> usize {
        self.redshifts.len()
    }

    pub fn n_luminosities(&self) -> usize {
        self.log_luminosities.len()
    }

    /// Normalized CDF over the luminosity grid at grid redshift `idx`.
    pub fn row(&self, idx: usize) -> &[f64] {
        &self.rows[idx]
    }
}

/// Sources follow the star formation history with luminosities drawn from an
/// evolving luminosity function.
#[derive(Debug, Clone)]
pub struct EvolvingLuminosity {
    pub cosmology: Cosmology,
    pub lf: LddeParameters,
    /// Local source density [Mpc^-3]
    pub density: f64,
    cdf_table: Option<LuminosityCdfTable>,
}

impl EvolvingLuminosity {
    pub fn new(cosmology: Cosmology, lf: LddeParameters, density: f64) -> Result<Self> {
        if density <= 0.0 {
            return Err(FiresongError::InvalidConfig(
                "local source density must be > 0".to_string(),
            ));
        }
        Ok(Self {
            cosmology,
            lf,
            density,
            cdf_table: None,
        })
    }

    pub fn cdf_table(&self) -> Option<&LuminosityCdfTable> {
        self.cdf_table.as_ref()
    }
}

/// Sources follow the star formation history and all share one luminosity.
#[derive(Debug, Clone)]
pub struct StandardCandle {
    pub cosmology: Cosmology,
    /// Local source density [Mpc^-3]
    pub density: f64,
    /// Target diffuse flux [GeV/cm^2.s.sr]
    pub fluxnorm: f64,
    /// Flux of a source placed at z = 1 [GeV/cm^2.s]
    pub flux_z1: f64,
    /// Common intrinsic luminosity [erg/s]
    pub luminosity: f64,
    dl1_squared: f64,
}

impl StandardCandle {
    /// Candle at the reference normalization scaled to `density` and `fluxnorm`.
    pub fn new(
        cosmology: Cosmology,
        density: f64,
        fluxnorm: f64,
        index: f64,
        emin: f64,
        emax: f64,
    ) -> Result<Self> {
        if density <= 0.0 {
            return Err(FiresongError::InvalidConfig(
                "local source density must be > 0".to_string(),
            ));
        }
        let flux_z1 = CANDLE_FLUX_Z1 * (CANDLE_REFERENCE_DENSITY / density)
            * (fluxnorm / CANDLE_REFERENCE_FLUXNORM);
        let luminosity = flux_z1 / luminosity_to_flux(&cosmology, 1.0, index, emin, emax, 1.0);
        let dl1 = cosmology.luminosity_distance(1.0);

        Ok(Self {
            cosmology,
            density,
            fluxnorm,
            flux_z1,
            luminosity,
            dl1_squared: dl1 * dl1,
        })
    }

    /// Rescale the candle so `n_sources` sources drawn from `redshifts` have
    /// an expected summed flux of `4 pi fluxnorm`:
    /// `flux_z1 = 4 pi fluxnorm / (N dL(1)^2 E[1 / dL(z)^2])`.
    pub fn normalize(&mut self, redshifts: &InverseCdf, n_sources: usize) -> Result<()> {
        let mean_inverse_square: f64 = redshifts
            .bins()
            .iter()
            .zip(redshifts.normalized_pdf())
            .map(|(&z, p)| {
                let dl = self.cosmology.luminosity_distance(z);
                p / (dl * dl)
            })
            .sum();
        let denominator = n_sources as f64 * self.dl1_squared * mean_inverse_square;
        if !(denominator > 0.0 && denominator.is_finite()) {
            return Err(FiresongError::DivisionByZero {
                context: "standard candle normalization",
            });
        }

        let flux_z1 = 4.0 * std::f64::consts::PI * self.fluxnorm / denominator;
        self.luminosity *= flux_z1 / self.flux_z1;
        debug!(
            reference = self.flux_z1,
            flux_z1, n_sources, "standard candle normalized"
        );
        self.flux_z1 = flux_z1;
        Ok(())
    }
}

/// Evolution model selected by `EvolutionKind`.
#[derive(Debug, Clone)]
pub enum EvolutionModel {
    EvolvingLuminosity(EvolvingLuminosity),
    StandardCandle(StandardCandle),
}

impl EvolutionModel {
    pub fn new(
        kind: EvolutionKind,
        cosmology: Cosmology,
        density: f64,
        fluxnorm: f64,
        index: f64,
        emin: f64,
        emax: f64,
    ) -> Result<Self> {
        let model = match kind {
            EvolutionKind::Ha2014Bl => Self::EvolvingLuminosity(EvolvingLuminosity::new(
                cosmology,
                LddeParameters::ha2014_bl(),
                density,
            )?),
            EvolutionKind::StandardCandle => Self::StandardCandle(StandardCandle::new(
                cosmology, density, fluxnorm, index, emin, emax,
            )?),
        };
        info!(model = %kind, density, "evolution model initialised");
        Ok(model)
    }

    /// Model for a run configuration in the Planck 2015 cosmology.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        Self::new(
            config.evolution,
            Cosmology::planck2015(),
            config.density,
            config.fluxnorm,
            config.index,
            config.emin,
            config.emax,
        )
    }

    pub fn kind(&self) -> EvolutionKind {
        match self {
            Self::EvolvingLuminosity(_) => EvolutionKind::Ha2014Bl,
            Self::StandardCandle(_) => EvolutionKind::StandardCandle,
        }
    }

    pub fn cosmology(&self) -> &Cosmology {
        match self {
            Self::EvolvingLuminosity(m) => &m.cosmology,
            Self::StandardCandle(m) => &m.cosmology,
        }
    }

    fn density(&self) -> f64 {
        match self {
            Self::EvolvingLuminosity(m) => m.density,
            Self::StandardCandle(m) => m.density,
        }
    }

    /// Unnormalized full-sky source density per unit redshift.
    pub fn redshift_distribution(&self, z: f64) -> f64 {
        sfh_redshift_distribution(self.cosmology(), z)
    }

    /// Expected number of sources with redshift below `zmax`.
    pub fn n_sources(&self, zmax: f64) -> Result<f64> {
        if !(zmax > 0.0) {
            return Err(FiresongError::InvalidConfig(format!(
                "zmax must be > 0, got {zmax}"
            )));
        }
        Ok(sfh_source_count(self.cosmology(), self.density(), zmax))
    }

    /// Precompute the luminosity CDF per redshift. Standard candles need none.
    pub fn luminosity_cdf(&mut self, redshift_grid: &[f64], luminosity_grid: &[f64]) -> Result<()> {
        match self {
            Self::EvolvingLuminosity(m) => {
                let table = LuminosityCdfTable::build(&m.lf, redshift_grid, luminosity_grid)?;
                debug!(
                    redshifts = table.n_redshifts(),
                    luminosities = table.n_luminosities(),
                    "luminosity CDF table built"
                );
                m.cdf_table = Some(table);
                Ok(())
            }
            Self::StandardCandle(_) => {
                if redshift_grid.is_empty() || luminosity_grid.is_empty() {
                    return Err(FiresongError::InvalidConfig(
                        "redshift and luminosity grids must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Fix the standard-candle flux to the population about to be drawn.
    /// Evolving models are left unchanged.
    pub fn normalize_flux(&mut self, redshifts: &InverseCdf, n_sources: usize) -> Result<()> {
        match self {
            Self::StandardCandle(m) if n_sources > 0 => m.normalize(redshifts, n_sources),
            _ => Ok(()),
        }
    }

    /// Luminosity [erg/s] of one source at redshift `z`.
    ///
    /// Draws exactly one uniform variate for evolving models and none for
    /// standard candles.
    pub fn sample_luminosity<R: Rng + ?Sized>(&self, z: f64, rng: &mut R) -> Result<f64> {
        match self {
            Self::EvolvingLuminosity(m) => {
                let table = m.cdf_table.as_ref().ok_or_else(|| {
                    FiresongError::InvalidConfig(
                        "luminosity CDF must be prepared before sampling".to_string(),
                    )
                })?;
                Ok(table.sample(z, rng.gen::<f64>()))
            }
            Self::StandardCandle(m) => Ok(m.luminosity),
        }
    }

    /// Luminosities for a batch of redshifts, drawn in order from one stream.
    pub fn luminosity_sampling<R: Rng + ?Sized>(&self, zs: &[f64], rng: &mut R) -> Result<Vec<f64>> {
        zs.iter().map(|&z| self.sample_luminosity(z, rng)).collect()
    }

    /// E^2 dN/dE at 100 TeV [GeV/cm^2.s] of a source at redshift `z`.
    pub fn lumi2flux(&self, luminosity: f64, index: f64, emin: f64, emax: f64, z: f64) -> f64 {
        match self {
            Self::EvolvingLuminosity(m) => {
                luminosity_to_flux(&m.cosmology, luminosity, index, emin, emax, z)
            }
            Self::StandardCandle(m) => {
                let dl = m.cosmology.luminosity_distance(z);
                m.flux_z1 * (luminosity / m.luminosity) * m.dl1_squared / (dl * dl)
            }
        }
    }
}
