use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use firesong::config::SensitivityConfig;
use firesong::output::{
    create_timestamped_output_dir, read_population_file, resolve_output_root,
    write_significance_csv, write_summary_json, SensitivitySummary, SignificanceRow,
};
use firesong::population::SourceStreams;
use firesong::significance::{evaluate_trials, SignificanceEvaluator};
use firesong::spectrum::{FluxConvention, SpectralIntegrator};
use firesong::tables::{BackgroundRate, EblAttenuation, EffectiveArea};

#[derive(Debug, Parser)]
#[command(author, version, about = "Gamma-ray follow-up significance of neutrino sources")]
struct Cli {
    /// TOML instrument configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output root (default: $FIRESONG or output-firesong)
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// Population file written by `firesong`
    #[arg(long, conflicts_with_all = ["fluxnorm", "redshift"])]
    population: Option<PathBuf>,

    /// Single source flux normalization [GeV/cm^2.s]
    #[arg(long, requires = "redshift")]
    fluxnorm: Option<f64>,

    /// Single source redshift
    #[arg(long, requires = "fluxnorm")]
    redshift: Option<f64>,

    #[arg(long)]
    effective_area: Option<PathBuf>,

    #[arg(long)]
    background: Option<PathBuf>,

    /// EBL optical depth table
    #[arg(long)]
    ebl: Option<PathBuf>,

    /// Ignore EBL attenuation
    #[arg(long, default_value_t = false)]
    no_ebl: bool,

    /// Observation time [h]
    #[arg(long)]
    obs_time: Option<f64>,

    /// On/off exposure ratio
    #[arg(long)]
    alpha: Option<f64>,

    /// Treat sources as transients
    #[arg(long, default_value_t = false)]
    transient: bool,

    /// Transient duration scale [s]
    #[arg(long)]
    timescale: Option<f64>,

    /// absolute or normalized-100tev
    #[arg(long)]
    convention: Option<FluxConvention>,

    #[arg(long)]
    index: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => SensitivityConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SensitivityConfig::default(),
    };
    if let Some(v) = cli.effective_area {
        cfg.effective_area = v;
    }
    if let Some(v) = cli.background {
        cfg.background = v;
    }
    if let Some(v) = cli.ebl {
        cfg.ebl = Some(v);
    }
    if cli.no_ebl {
        cfg.ebl = None;
    }
    if let Some(v) = cli.obs_time {
        cfg.obs_time_hours = v;
    }
    if let Some(v) = cli.alpha {
        cfg.alpha = v;
    }
    if cli.transient {
        cfg.transient = true;
    }
    if let Some(v) = cli.timescale {
        cfg.timescale = v;
    }
    if let Some(v) = cli.convention {
        cfg.convention = v;
    }
    if let Some(v) = cli.index {
        cfg.index = v;
    }
    if let Some(v) = cli.seed {
        cfg.seed = Some(v);
    }
    cfg.validate().context("invalid sensitivity configuration")?;

    let trials: Vec<(f64, f64)> = match (&cli.population, cli.fluxnorm, cli.redshift) {
        (Some(path), _, _) => read_population_file(path)
            .with_context(|| format!("failed to read population {}", path.display()))?
            .iter()
            .map(|entry| (entry.flux, entry.redshift))
            .collect(),
        (None, Some(fluxnorm), Some(redshift)) => vec![(fluxnorm, redshift)],
        _ => bail!("either --population or both --fluxnorm and --redshift are required"),
    };

    let area = EffectiveArea::load(&cfg.effective_area).with_context(|| {
        format!(
            "failed to load effective area {}",
            cfg.effective_area.display()
        )
    })?;
    let background = BackgroundRate::load(&cfg.background)
        .with_context(|| format!("failed to load background {}", cfg.background.display()))?;
    let ebl = match &cfg.ebl {
        Some(path) => Some(
            EblAttenuation::load(path)
                .with_context(|| format!("failed to load EBL table {}", path.display()))?,
        ),
        None => None,
    };

    let integrator = SpectralIntegrator::new(&area, ebl)?;
    let evaluator = SignificanceEvaluator::new(integrator, &background, &cfg)?;

    let streams = match cfg.seed {
        Some(seed) => SourceStreams::new(seed),
        None => SourceStreams::from_entropy(),
    };
    info!(
        trials = trials.len(),
        background = evaluator.background_counts(),
        transient = evaluator.is_transient(),
        seed = streams.seed(),
        "evaluating significance"
    );

    let results = evaluate_trials(&evaluator, &trials, streams);
    let rows: Vec<SignificanceRow> = trials
        .iter()
        .zip(&results)
        .enumerate()
        .map(|(i, (&(fluxnorm, redshift), result))| {
            SignificanceRow::new(i, redshift, fluxnorm, result)
        })
        .collect();

    let output_root = resolve_output_root(cli.outdir.as_deref());
    let output_dir = create_timestamped_output_dir(&output_root)
        .with_context(|| format!("failed to create run directory under {}", output_root.display()))?;
    let csv_path = output_dir.join("significance.csv");
    let summary_path = output_dir.join("summary.json");
    let summary = SensitivitySummary::from_results(
        &cfg,
        streams.seed(),
        evaluator.background_counts(),
        &results,
    );
    write_significance_csv(&csv_path, &rows)?;
    write_summary_json(&summary_path, &summary)?;

    println!(
        "Trials: {} | background counts: {:.2}",
        summary.n_trials, summary.background_counts
    );
    println!(
        "Li & Ma >= 5 sigma: {} | S/sqrt(B) >= 5 sigma: {}",
        summary.li_ma_detections, summary.gaussian_detections
    );
    println!(
        "Li & Ma undefined: {} | invalid: {}",
        summary.li_ma_undefined, summary.li_ma_invalid
    );
    println!("CSV: {}", csv_path.display());
    println!("Summary: {}", summary_path.display());

    Ok(())
}
