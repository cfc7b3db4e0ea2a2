use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wmls_pipeline::collaborators::{DlwmlsSegmenter, GreedyRegistrar, LpsReorienter};
use wmls_pipeline::enums::{BackgroundPolicy, Device};
use wmls_pipeline::pipeline::{
    CohortConfig, CohortPipeline, DEFAULT_FLAIR_SUFFIX, DEFAULT_PARCELLATION_SUFFIX,
    DEFAULT_T1_SUFFIX, LogObserver,
};
use wmls_pipeline::workspace::read_roster;

/// White matter lesion segmentation and ROI volumetrics pipeline
#[derive(Parser)]
#[command(name = "wmls-pipeline", version)]
struct Cli {
    /// Folder with the input FLAIR scans
    #[arg(long = "fl_dir", value_name = "DIR")]
    fl_dir: PathBuf,

    /// Suffix of the input FLAIR scans
    #[arg(long = "fl_suff", value_name = "SUFFIX", default_value = DEFAULT_FLAIR_SUFFIX)]
    fl_suff: String,

    /// Folder with the input T1 scans
    #[arg(long = "t1_dir", value_name = "DIR")]
    t1_dir: PathBuf,

    /// Suffix of the input T1 scans
    #[arg(long = "t1_suff", value_name = "SUFFIX", default_value = DEFAULT_T1_SUFFIX)]
    t1_suff: String,

    /// Folder with the anatomical parcellation masks
    #[arg(long = "dlmuse_dir", value_name = "DIR")]
    dlmuse_dir: PathBuf,

    /// Suffix of the parcellation masks
    #[arg(long = "dlmuse_suff", value_name = "SUFFIX", default_value = DEFAULT_PARCELLATION_SUFFIX)]
    dlmuse_suff: String,

    /// CSV list of MRIDs; the first row (column header) is skipped
    #[arg(long, value_name = "FILE")]
    list: PathBuf,

    /// Output folder; existing contents are discarded
    #[arg(short = 'o', long = "out_dir", value_name = "DIR")]
    out_dir: PathBuf,

    /// Remove all intermediate files
    #[arg(
        short = 'r',
        long = "remove_intermediate",
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    remove_intermediate: bool,

    /// Device to run segmentation on
    #[arg(short = 'd', long, value_enum, default_value_t = Device::Cuda)]
    device: Device,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mrids = read_roster(&cli.list)
        .with_context(|| format!("reading cohort list {}", cli.list.display()))?;
    info!("loaded {} subjects from {}", mrids.len(), cli.list.display());

    let config = CohortConfig {
        t1_dir: cli.t1_dir,
        t1_suffix: cli.t1_suff,
        flair_dir: cli.fl_dir,
        flair_suffix: cli.fl_suff,
        parcellation_dir: cli.dlmuse_dir,
        parcellation_suffix: cli.dlmuse_suff,
        output_dir: cli.out_dir,
        device: cli.device,
        retain_intermediates: !cli.remove_intermediate,
        background_policy: BackgroundPolicy::default(),
    };

    let normalizer = LpsReorienter;
    let segmenter = DlwmlsSegmenter::default();
    let registrar = GreedyRegistrar::default();
    let pipeline = CohortPipeline::new(config, &normalizer, &segmenter, &registrar);

    let report = pipeline
        .run(&mrids, &LogObserver)
        .context("cohort run failed")?;
    info!(
        "cohort finished: {} quantified, {} excluded",
        report.completed(),
        report.excluded()
    );

    Ok(())
}
