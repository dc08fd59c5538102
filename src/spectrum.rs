//! Expected signal counts of a power-law source in the instrument
//!
//! Sums `dN/dE * exp(-tau(E, z)) * area * dE * exposure` over the
//! effective-area energy bins. The attenuation table stops at 100 TeV, so
//! only bins at or below that energy take part.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tables::{AreaBin, EblAttenuation, EffectiveArea, EBL_MAX_ENERGY_TEV};
use crate::{FiresongError, Result};

/// Half-width of an effective-area bin in log10(E / TeV).
pub const BIN_HALF_WIDTH_DEX: f64 = 0.025;
/// m^2 in cm^2
pub const M2_TO_CM2: f64 = 1e4;

/// How `fluxnorm` is turned into dN/dE [1/(TeV.cm^2.s)].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluxConvention {
    /// Source flux in GeV/cm^2.s:
    /// `fluxnorm / 1000 * E^-index * 100^(index - 2)`
    #[serde(rename = "absolute")]
    Absolute,
    /// E^2 dN/dE at 100 TeV in GeV/cm^2.s:
    /// `fluxnorm * 1e-7 * (E / 100 TeV)^-index`
    #[serde(rename = "normalized-100tev")]
    NormalizedAt100TeV,
}

impl fmt::Display for FluxConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute => write!(f, "absolute"),
            Self::NormalizedAt100TeV => write!(f, "normalized-100tev"),
        }
    }
}

impl FromStr for FluxConvention {
    type Err = FiresongError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "absolute" => Ok(Self::Absolute),
            "normalized-100tev" | "normalized" => Ok(Self::NormalizedAt100TeV),
            other => Err(FiresongError::InvalidConfig(format!(
                "unknown flux convention: {other} (expected absolute or normalized-100tev)"
            ))),
        }
    }
}

/// Differential flux [1/(TeV.cm^2.s)] at `energy_tev`, absolute convention.
pub fn dnde_absolute(fluxnorm: f64, index: f64, energy_tev: f64) -> f64 {
    fluxnorm / 1000.0 * energy_tev.powf(-index) * 100f64.powf(index - 2.0)
}

/// Differential flux [1/(TeV.cm^2.s)] at `energy_tev`, normalized at 100 TeV.
pub fn dnde_normalized(fluxnorm: f64, index: f64, energy_tev: f64) -> f64 {
    fluxnorm * 1e-7 * (energy_tev / 100.0).powf(-index)
}

/// Width [TeV] of the bin centred on `energy_tev`.
pub fn bin_width(energy_tev: f64) -> f64 {
    let log_e = energy_tev.log10();
    10f64.powf(log_e + BIN_HALF_WIDTH_DEX) - 10f64.powf(log_e - BIN_HALF_WIDTH_DEX)
}

#[derive(Debug, Clone)]
pub struct SpectralIntegrator {
    bins: Vec<AreaBin>,
    ebl: Option<EblAttenuation>,
}

impl SpectralIntegrator {
    /// Integrator over the bins of `area` up to 100 TeV. Without an
    /// attenuation table the spectrum is left unattenuated.
    pub fn new(area: &EffectiveArea, ebl: Option<EblAttenuation>) -> Result<Self> {
        let bins = area.bins_below(EBL_MAX_ENERGY_TEV).to_vec();
        if bins.is_empty() {
            return Err(FiresongError::InvalidConfig(format!(
                "effective area has no bins at or below {EBL_MAX_ENERGY_TEV} TeV"
            )));
        }
        debug!(
            used = bins.len(),
            total = area.bins().len(),
            attenuated = ebl.is_some(),
            "spectral integrator ready"
        );
        Ok(Self { bins, ebl })
    }

    pub fn bins(&self) -> &[AreaBin] {
        &self.bins
    }

    fn attenuation(&self, energy_tev: f64, redshift: f64) -> f64 {
        self.ebl
            .as_ref()
            .map_or(1.0, |ebl| ebl.attenuation(energy_tev, redshift))
    }

    fn integrate(&self, redshift: f64, exposure_s: f64, dnde: impl Fn(f64) -> f64) -> f64 {
        self.bins
            .iter()
            .map(|bin| {
                let e = bin.energy_tev;
                dnde(e)
                    * self.attenuation(e, redshift)
                    * bin.area_m2
                    * M2_TO_CM2
                    * bin_width(e)
                    * exposure_s
            })
            .sum()
    }

    /// Counts for a source flux in GeV/cm^2.s.
    pub fn counts_absolute(&self, fluxnorm: f64, index: f64, redshift: f64, exposure_s: f64) -> f64 {
        self.integrate(redshift, exposure_s, |e| dnde_absolute(fluxnorm, index, e))
    }

    /// Counts for an E^2 dN/dE normalization at 100 TeV in GeV/cm^2.s.
    pub fn counts_normalized(
        &self,
        fluxnorm: f64,
        index: f64,
        redshift: f64,
        exposure_s: f64,
    ) -> f64 {
        self.integrate(redshift, exposure_s, |e| dnde_normalized(fluxnorm, index, e))
    }

    pub fn expected_counts(
        &self,
        convention: FluxConvention,
        fluxnorm: f64,
        index: f64,
        redshift: f64,
        exposure_s: f64,
    ) -> f64 {
        match convention {
            FluxConvention::Absolute => self.counts_absolute(fluxnorm, index, redshift, exposure_s),
            FluxConvention::NormalizedAt100TeV => {
                self.counts_normalized(fluxnorm, index, redshift, exposure_s)
            }
        }
    }
}
