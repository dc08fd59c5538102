use std::env;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;
use serde::Serialize;
use tracing::info;

use crate::config::{SensitivityConfig, SimulationConfig};
use crate::population::{Population, Source, SourceSink};
use crate::significance::{LiMaSignificance, SignificanceResult};
use crate::tables::TabulatedFunction;
use crate::Result;

/// Environment variable naming the output root.
pub const OUTPUT_ENV_VAR: &str = "FIRESONG";
pub const DEFAULT_OUTPUT_ROOT: &str = "output-firesong";

/// Significance above which a source counts as detected.
pub const DETECTION_THRESHOLD_SIGMA: f64 = 5.0;

/// `--outdir`, else `$FIRESONG`, else `output-firesong`.
pub fn resolve_output_root(cli: Option<&Path>) -> PathBuf {
    if let Some(dir) = cli {
        return dir.to_path_buf();
    }
    match env::var_os(OUTPUT_ENV_VAR) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_OUTPUT_ROOT),
    }
}

pub fn create_timestamped_output_dir(output_root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_root)?;

    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let mut output_dir = output_root.join(&timestamp);
    let mut counter = 1_u32;

    while output_dir.exists() {
        output_dir = output_root.join(format!("{timestamp}-{counter:02}"));
        counter += 1;
    }

    fs::create_dir_all(&output_dir)?;
    Ok(output_dir)
}

/// `<stem>_zNEAR_<z_near>.out` next to the main file.
pub fn near_file_name(filename: &str, z_near: f64) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    format!("{stem}_zNEAR_{z_near}.out")
}

fn write_header<W: Write>(out: &mut W, config: &SimulationConfig) -> Result<()> {
    let delta_gamma = 2.0 - config.index;
    writeln!(out, "# FIRESONG Output description")?;
    writeln!(out, "# Evolution: {}", config.evolution)?;
    writeln!(
        out,
        "# Desired neutrino diffuse flux: E^2 dN/dE = {:e} (E/100 TeV)^({delta_gamma}) [GeV/cm^2.s.sr]",
        config.fluxnorm
    )?;
    writeln!(out, "# Local source density: {:e} [Mpc^-3]", config.density)?;
    writeln!(out, "# Redshift range: {} - {}", config.zmin, config.zmax)?;
    writeln!(out, "# Declination: degrees")?;
    writeln!(out, "# Redshift")?;
    writeln!(
        out,
        "# flux: E^2 dN/dE at 100 TeV assuming (E/100 TeV)^({delta_gamma}) [GeV/cm^2.s]"
    )?;
    writeln!(
        out,
        "#     point sources of ~{:e} can be detected in these units",
        crate::population::POINT_SOURCE_SENSITIVITY
    )?;
    if config.observed_counts {
        writeln!(
            out,
            "# Observed: number of >200 TeV neutrino events detected by IceCube"
        )?;
        writeln!(out, "# declination     z      flux       observed")?;
    } else {
        writeln!(out, "# declination     z      flux")?;
    }
    Ok(())
}

fn write_row<W: Write>(out: &mut W, source: &Source) -> Result<()> {
    match source.observed {
        Some(observed) => writeln!(
            out,
            "{} {} {:e} {observed}",
            source.declination_deg, source.redshift, source.flux
        )?,
        None => writeln!(
            out,
            "{} {} {:e}",
            source.declination_deg, source.redshift, source.flux
        )?,
    }
    Ok(())
}

/// Paths written by a finished population run.
#[derive(Debug, Clone)]
pub struct PopulationOutputs {
    pub population_path: PathBuf,
    pub near_path: Option<PathBuf>,
}

/// Sources below `z_near`, written to their own file with their own total.
struct NearFile {
    z_near: f64,
    path: PathBuf,
    out: BufWriter<File>,
    total_flux: f64,
}

/// Text sink for a population: one row per source, a summary line at the end.
pub struct OutputWriter {
    path: PathBuf,
    out: BufWriter<File>,
    near: Option<NearFile>,
}

impl OutputWriter {
    pub fn create(output_dir: &Path, config: &SimulationConfig) -> Result<Self> {
        let path = output_dir.join(&config.filename);
        let mut out = BufWriter::new(File::create(&path)?);
        write_header(&mut out, config)?;

        let near = match config.z_near {
            Some(z_near) => {
                let near_path = output_dir.join(near_file_name(&config.filename, z_near));
                let mut near_out = BufWriter::new(File::create(&near_path)?);
                write_header(&mut near_out, config)?;
                writeln!(near_out, "# sources with z < {z_near}")?;
                Some(NearFile {
                    z_near,
                    path: near_path,
                    out: near_out,
                    total_flux: 0.0,
                })
            }
            None => None,
        };

        Ok(Self { path, out, near })
    }

    /// Write the summary lines and flush both files. The near file reports
    /// the diffuse flux of its own sources.
    pub fn finish(mut self, population: &Population) -> Result<PopulationOutputs> {
        writeln!(self.out, "# E^2 dNdE = {:e}", population.diffuse_flux())?;
        if !population.point_source_fluxes.is_empty() {
            let fluxes: Vec<String> = population
                .point_source_fluxes
                .iter()
                .map(|f| format!("{f:e}"))
                .collect();
            writeln!(
                self.out,
                "# Fluxes exceeding Point Source limits [{}]",
                fluxes.join(", ")
            )?;
        }
        self.out.flush()?;

        let near_path = match self.near.take() {
            Some(mut near) => {
                writeln!(
                    near.out,
                    "# E^2 dNdE = {:e}",
                    near.total_flux / (4.0 * std::f64::consts::PI)
                )?;
                near.out.flush()?;
                Some(near.path)
            }
            None => None,
        };

        info!(path = %self.path.display(), "population written");
        Ok(PopulationOutputs {
            population_path: self.path,
            near_path,
        })
    }
}

impl SourceSink for OutputWriter {
    fn write_source(&mut self, source: &Source) -> Result<()> {
        write_row(&mut self.out, source)?;
        if let Some(near) = self.near.as_mut() {
            if source.redshift < near.z_near {
                write_row(&mut near.out, source)?;
                near.total_flux += source.flux;
            }
        }
        Ok(())
    }
}

/// One source read back from a population file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopulationEntry {
    pub declination_deg: f64,
    pub redshift: f64,
    pub flux: f64,
}

/// Source rows of a population file; an empty population yields no entries.
pub fn read_population_file(path: &Path) -> Result<Vec<PopulationEntry>> {
    let raw = fs::read_to_string(path)?;
    let has_rows = raw.lines().any(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    });
    if !has_rows {
        return Ok(Vec::new());
    }
    let table = TabulatedFunction::parse(&raw, &path.display().to_string())?;
    table.require_columns(3)?;
    Ok(table
        .rows()
        .iter()
        .map(|row| PopulationEntry {
            declination_deg: row[0],
            redshift: row[1],
            flux: row[2],
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulationSummary {
    pub evolution: String,
    pub seed: u64,
    pub expected_sources: f64,
    pub n_sources: usize,
    pub total_flux: f64,
    pub diffuse_flux: f64,
    pub target_fluxnorm: f64,
    pub index: f64,
    pub density: f64,
    pub zmin: f64,
    pub zmax: f64,
    pub redshift_bins: usize,
    pub luminosity_bins: usize,
    pub observed_events: u64,
    pub point_source_detectable: usize,
}

impl PopulationSummary {
    pub fn new(config: &SimulationConfig, population: &Population) -> Self {
        Self {
            evolution: config.evolution.to_string(),
            seed: population.seed,
            expected_sources: population.expected_sources,
            n_sources: population.n_sources,
            total_flux: population.total_flux,
            diffuse_flux: population.diffuse_flux(),
            target_fluxnorm: config.fluxnorm,
            index: config.index,
            density: config.density,
            zmin: config.zmin,
            zmax: config.zmax,
            redshift_bins: config.bins,
            luminosity_bins: config.luminosity_bins,
            observed_events: population.observed_events,
            point_source_detectable: population.point_source_fluxes.len(),
        }
    }
}

/// Flat CSV record of one significance trial.
#[derive(Debug, Clone, Serialize)]
pub struct SignificanceRow {
    pub trial: usize,
    pub redshift: f64,
    pub fluxnorm: f64,
    pub event_duration_s: f64,
    pub signal_counts: f64,
    pub background_counts: f64,
    pub li_ma: f64,
    pub li_ma_status: &'static str,
    pub gaussian: f64,
}

impl SignificanceRow {
    pub fn new(trial: usize, redshift: f64, fluxnorm: f64, result: &SignificanceResult) -> Self {
        Self {
            trial,
            redshift,
            fluxnorm,
            event_duration_s: result.event_duration,
            signal_counts: result.signal_counts,
            background_counts: result.background_counts,
            li_ma: result.li_ma.as_sentinel(),
            li_ma_status: result.li_ma.status(),
            gaussian: result.gaussian,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensitivitySummary {
    pub n_trials: usize,
    pub seed: u64,
    pub transient: bool,
    pub obs_time_hours: f64,
    pub alpha: f64,
    pub background_counts: f64,
    pub li_ma_detections: usize,
    pub gaussian_detections: usize,
    pub li_ma_undefined: usize,
    pub li_ma_invalid: usize,
    pub max_li_ma: f64,
    pub max_gaussian: f64,
}

impl SensitivitySummary {
    pub fn from_results(
        config: &SensitivityConfig,
        seed: u64,
        background_counts: f64,
        results: &[SignificanceResult],
    ) -> Self {
        let mut summary = Self {
            n_trials: results.len(),
            seed,
            transient: config.transient,
            obs_time_hours: config.obs_time_hours,
            alpha: config.alpha,
            background_counts,
            li_ma_detections: 0,
            gaussian_detections: 0,
            li_ma_undefined: 0,
            li_ma_invalid: 0,
            max_li_ma: 0.0,
            max_gaussian: 0.0,
        };

        for result in results {
            match result.li_ma {
                LiMaSignificance::Valid(v) => {
                    if v >= DETECTION_THRESHOLD_SIGMA {
                        summary.li_ma_detections += 1;
                    }
                    summary.max_li_ma = summary.max_li_ma.max(v);
                }
                LiMaSignificance::Undefined => summary.li_ma_undefined += 1,
                LiMaSignificance::Invalid => summary.li_ma_invalid += 1,
            }
            if result.gaussian >= DETECTION_THRESHOLD_SIGMA {
                summary.gaussian_detections += 1;
            }
            summary.max_gaussian = summary.max_gaussian.max(result.gaussian);
        }
        summary
    }
}

pub fn write_significance_csv(path: &Path, rows: &[SignificanceRow]) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_summary_json<T: Serialize>(path: &Path, summary: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json)?;
    Ok(())
}
