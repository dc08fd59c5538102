use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use firesong::config::{EvolutionKind, SimulationConfig};
use firesong::output::{
    create_timestamped_output_dir, resolve_output_root, write_summary_json, OutputWriter,
    PopulationSummary,
};
use firesong::population::{generate_population, SourceStreams};
use firesong::EvolutionModel;

#[derive(Debug, Parser)]
#[command(author, version, about = "Extragalactic neutrino source population synthesis")]
struct Cli {
    /// TOML run configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output root (default: $FIRESONG or output-firesong)
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// Population file name
    #[arg(short = 'o', long)]
    filename: Option<String>,

    /// Source evolution: HA2014BL or StandardCandle
    #[arg(long)]
    evolution: Option<EvolutionKind>,

    #[arg(long)]
    zmin: Option<f64>,

    /// Highest redshift to be simulated
    #[arg(long)]
    zmax: Option<f64>,

    /// Redshift grid bins
    #[arg(long)]
    bins: Option<usize>,

    /// Diffuse flux A on E^2 dN/dE = A (E/100 TeV)^(2-index) [GeV/cm^2.s.sr]
    #[arg(long)]
    fluxnorm: Option<f64>,

    /// Neutrino spectral index
    #[arg(long)]
    index: Option<f64>,

    /// log10 of the lowest luminosity [erg/s]
    #[arg(long)]
    lmin: Option<f64>,

    /// log10 of the highest luminosity [erg/s]
    #[arg(long)]
    lmax: Option<f64>,

    /// Local source density [Mpc^-3]
    #[arg(long)]
    density: Option<f64>,

    /// Also write sources below this redshift to a separate file
    #[arg(long = "z-near")]
    z_near: Option<f64>,

    /// List sources above the point-source sensitivity
    #[arg(long, default_value_t = false)]
    point_source_comparison: bool,

    /// Skip the IceCube observed-count column
    #[arg(long, default_value_t = false)]
    no_observed: bool,

    /// Random seed
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
        Some(path) => SimulationConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    if let Some(v) = cli.filename {
        cfg.filename = v;
    }
    if let Some(v) = cli.evolution {
        cfg.evolution = v;
    }
    if let Some(v) = cli.zmin {
        cfg.zmin = v;
    }
    if let Some(v) = cli.zmax {
        cfg.zmax = v;
    }
    if let Some(v) = cli.bins {
        cfg.bins = v;
    }
    if let Some(v) = cli.fluxnorm {
        cfg.fluxnorm = v;
    }
    if let Some(v) = cli.index {
        cfg.index = v;
    }
    if let Some(v) = cli.lmin {
        cfg.lmin = v;
    }
    if let Some(v) = cli.lmax {
        cfg.lmax = v;
    }
    if let Some(v) = cli.density {
        cfg.density = v;
    }
    if let Some(v) = cli.z_near {
        cfg.z_near = Some(v);
    }
    if cli.point_source_comparison {
        cfg.point_source_comparison = true;
    }
    if cli.no_observed {
        cfg.observed_counts = false;
    }
    if let Some(v) = cli.seed {
        cfg.seed = Some(v);
    }
    cfg.validate().context("invalid simulation configuration")?;

    let streams = match cfg.seed {
        Some(seed) => SourceStreams::new(seed),
        None => SourceStreams::from_entropy(),
    };
    info!(seed = streams.seed(), "random streams seeded");

    let output_root = resolve_output_root(cli.outdir.as_deref());
    let output_dir = create_timestamped_output_dir(&output_root)
        .with_context(|| format!("failed to create run directory under {}", output_root.display()))?;

    let mut model = EvolutionModel::from_config(&cfg)?;
    let mut writer = OutputWriter::create(&output_dir, &cfg)?;
    let population = generate_population(&mut model, &cfg, streams, &mut writer)?;
    let outputs = writer.finish(&population)?;

    let summary_path = output_dir.join("summary.json");
    write_summary_json(&summary_path, &PopulationSummary::new(&cfg, &population))?;

    let delta_gamma = 2.0 - cfg.index;
    println!("Sources simulated: {}", population.n_sources);
    println!(
        "Actual diffuse flux simulated: E^2 dNdE = {:e} (E/100 TeV)^({delta_gamma}) [GeV/cm^2.s.sr]",
        population.diffuse_flux()
    );
    println!("Population: {}", outputs.population_path.display());
    if let Some(near) = &outputs.near_path {
        println!("Near sources: {}", near.display());
    }
    println!("Summary: {}", summary_path.display());
    if cfg.point_source_comparison {
        println!(
            "Sources above point-source sensitivity: {}",
            population.point_source_fluxes.len()
        );
    }

    Ok(())
}
