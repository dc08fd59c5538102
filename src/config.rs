use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::spectrum::FluxConvention;
use crate::{FiresongError, Result};

/// Source evolution model names accepted on the command line and in configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvolutionKind {
    /// BL Lac luminosity-dependent density evolution
    #[serde(rename = "HA2014BL")]
    Ha2014Bl,
    #[serde(rename = "StandardCandle")]
    StandardCandle,
}

impl fmt::Display for EvolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ha2014Bl => write!(f, "HA2014BL"),
            Self::StandardCandle => write!(f, "StandardCandle"),
        }
    }
}

impl FromStr for EvolutionKind {
    type Err = FiresongError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HA2014BL" => Ok(Self::Ha2014Bl),
            "StandardCandle" | "SC" => Ok(Self::StandardCandle),
            other => Err(FiresongError::InvalidConfig(format!(
                "unknown evolution model: {other} (expected HA2014BL or StandardCandle)"
            ))),
        }
    }
}

/// Population synthesis run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub evolution: EvolutionKind,
    /// Lowest simulated redshift
    pub zmin: f64,
    /// Highest simulated redshift (exclusive)
    pub zmax: f64,
    /// Number of redshift grid bins
    pub bins: usize,
    /// Diffuse flux normalization on E^2 dN/dE at 100 TeV [GeV/cm^2.s.sr]
    pub fluxnorm: f64,
    pub index: f64,
    /// Emission band [GeV]
    pub emin: f64,
    pub emax: f64,
    /// log10 luminosity range [erg/s]
    pub lmin: f64,
    pub lmax: f64,
    pub luminosity_bins: usize,
    /// Local source density [Mpc^-3]
    pub density: f64,
    pub seed: Option<u64>,
    /// Also write sources closer than this redshift to a separate file
    pub z_near: Option<f64>,
    pub point_source_comparison: bool,
    pub observed_counts: bool,
    pub filename: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            evolution: EvolutionKind::Ha2014Bl,
            zmin: 0.0005,
            zmax: 10.0,
            bins: 10_000,
            fluxnorm: 1.01e-8,
            index: 2.19,
            emin: 1e4,
            emax: 1e7,
            lmin: 38.0,
            lmax: 48.0,
            luminosity_bins: 1000,
            density: 1e-6,
            seed: None,
            z_near: None,
            point_source_comparison: false,
            observed_counts: true,
            filename: "Legend.out".to_string(),
        }
    }
}

impl SimulationConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: SimulationConfig = toml::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.zmin > 0.0) {
            return Err(FiresongError::InvalidConfig(
                "zmin must be greater than zero".to_string(),
            ));
        }
        if !(self.zmax > self.zmin) {
            return Err(FiresongError::InvalidConfig(format!(
                "zmax ({}) must be greater than zmin ({})",
                self.zmax, self.zmin
            )));
        }
        if self.bins == 0 {
            return Err(FiresongError::InvalidConfig(
                "bins must be greater than zero".to_string(),
            ));
        }
        if self.luminosity_bins == 0 {
            return Err(FiresongError::InvalidConfig(
                "luminosity_bins must be greater than zero".to_string(),
            ));
        }
        if !(self.lmax > self.lmin) {
            return Err(FiresongError::InvalidConfig(
                "lmax must be greater than lmin".to_string(),
            ));
        }
        if !(self.emin > 0.0 && self.emax > self.emin) {
            return Err(FiresongError::InvalidConfig(
                "energy band must satisfy 0 < emin < emax".to_string(),
            ));
        }
        if !(self.density > 0.0) || !(self.fluxnorm > 0.0) {
            return Err(FiresongError::InvalidConfig(
                "density and fluxnorm must be greater than zero".to_string(),
            ));
        }
        if !self.index.is_finite() {
            return Err(FiresongError::InvalidConfig(
                "index must be finite".to_string(),
            ));
        }
        if self.redshift_grid().is_empty() {
            return Err(FiresongError::InvalidConfig(
                "redshift grid is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Grid starting at `zmin` with step `zmax / bins`, below `zmax`.
    pub fn redshift_grid(&self) -> Vec<f64> {
        arange(self.zmin, self.zmax, self.zmax / self.bins as f64)
    }

    /// log10 luminosity grid with `luminosity_bins` steps over [lmin, lmax).
    pub fn luminosity_grid(&self) -> Vec<f64> {
        arange(
            self.lmin,
            self.lmax,
            (self.lmax - self.lmin) / self.luminosity_bins as f64,
        )
    }
}

/// Evenly spaced values `start + i * step` below `stop`.
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if !(step > 0.0) || !(stop > start) {
        return Vec::new();
    }
    let n = ((stop - start) / step).ceil() as usize;
    (0..n)
        .map(|i| start + i as f64 * step)
        .filter(|&v| v < stop)
        .collect()
}

/// Detection-significance run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    pub effective_area: PathBuf,
    pub background: PathBuf,
    /// Attenuation table; no attenuation when absent
    pub ebl: Option<PathBuf>,
    pub obs_time_hours: f64,
    /// On/off exposure ratio
    pub alpha: f64,
    pub transient: bool,
    /// Intrinsic transient duration [s]
    pub timescale: f64,
    pub convention: FluxConvention,
    pub index: f64,
    pub seed: Option<u64>,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            effective_area: PathBuf::from("Performance/CTA-Performance-North-5h-EffArea.txt"),
            background: PathBuf::from("Performance/CTA-Performance-North-5h-Background.txt"),
            ebl: Some(PathBuf::from("EBL_Gilmore.txt")),
            obs_time_hours: 5.0,
            alpha: 1.0,
            transient: false,
            timescale: 1000.0,
            convention: FluxConvention::NormalizedAt100TeV,
            index: 2.13,
            seed: None,
        }
    }
}

impl SensitivityConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: SensitivityConfig = toml::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.obs_time_hours > 0.0) {
            return Err(FiresongError::InvalidConfig(
                "obs_time_hours must be greater than zero".to_string(),
            ));
        }
        if !(self.alpha > 0.0) {
            return Err(FiresongError::InvalidConfig(
                "alpha must be greater than zero".to_string(),
            ));
        }
        if self.transient && !(self.timescale > 0.0) {
            return Err(FiresongError::InvalidConfig(
                "timescale must be greater than zero for transient sources".to_string(),
            ));
        }
        if !self.index.is_finite() {
            return Err(FiresongError::InvalidConfig(
                "index must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Observation window [s]
    pub fn observation_window(&self) -> f64 {
        3600.0 * self.obs_time_hours
    }
}
