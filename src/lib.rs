//! FIRESONG - FIRst Extragalactic Simulation Of Neutrinos and Gamma-rays
//!
//! Draws populations of extragalactic neutrino point sources from empirical
//! redshift and luminosity distributions, converts them to observable fluxes,
//! and evaluates the detection significance of each source for an imaging
//! gamma-ray instrument against its tabulated background.

pub mod config;
pub mod cosmology;
pub mod evolution;
pub mod output;
pub mod population;
pub mod sampling;
pub mod significance;
pub mod spectrum;
pub mod tables;

use thiserror::Error;

// Re-export main types
pub use config::{EvolutionKind, SensitivityConfig, SimulationConfig};
pub use cosmology::Cosmology;
pub use evolution::EvolutionModel;
pub use population::{generate_population, Population, Source, SourceSink, SourceStreams};
pub use sampling::InverseCdf;
pub use significance::{
    gaussian_significance, li_ma_significance, LiMaSignificance, SignificanceEvaluator,
    SignificanceResult, TransientTiming,
};
pub use spectrum::{FluxConvention, SpectralIntegrator};
pub use tables::{BackgroundRate, EblAttenuation, EffectiveArea, TabulatedFunction};

#[derive(Debug, Error)]
pub enum FiresongError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("division by zero: {context}")]
    DivisionByZero { context: &'static str },
    #[error("malformed table {path} (line {line}): {reason}")]
    MalformedTable {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("{context} length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("value {value} is outside the tabulated range [{min}, {max}]")]
    OutOfDomain { value: f64, min: f64, max: f64 },
}

pub type Result<T> = std::result::Result<T, FiresongError>;
