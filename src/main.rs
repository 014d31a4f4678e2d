use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use sam2_eval::bundle::MetricBundle;
use sam2_eval::config::EvalConfig;
use sam2_eval::datalist::ListKey;
use sam2_eval::evaluator::{log_bundle_summary, run_evaluation};
use sam2_eval::region_grow_predictor::RegionGrowPredictor;

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refine every labelled object with point prompts and record Dice per iteration
    Run {
        /// Evaluation config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        max_iter: Option<usize>,

        #[arg(long)]
        num_workers: Option<usize>,

        #[arg(long)]
        fold: Option<i64>,

        #[arg(long, value_enum)]
        list_key: Option<ListKey>,

        #[arg(long)]
        dataset_name: Option<String>,

        /// Write slices as JPEG frames before prompting
        #[arg(long)]
        export_frames: bool,

        /// Where to save the metric bundle
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
    /// Print the summary of a saved metric bundle
    Summarize {
        bundle: PathBuf,
    },
}

#[derive(Parser, Debug)]
#[command(name = "sam2-eval")]
#[command(about = "Iterative point-prompt evaluation of video predictors on 3D volumes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path).with_context(|| format!("creating log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            max_iter,
            num_workers,
            fold,
            list_key,
            dataset_name,
            export_frames,
            bundle,
        } => {
            let mut cfg = EvalConfig::from_file(&config)
                .with_context(|| format!("loading config {}", config.display()))?;
            if let Some(v) = max_iter {
                cfg.max_iter = v;
            }
            if let Some(v) = num_workers {
                cfg.num_workers = v;
            }
            if let Some(v) = fold {
                cfg.fold = v;
            }
            if let Some(v) = list_key {
                cfg.list_key = v;
            }
            if dataset_name.is_some() {
                cfg.dataset_name = dataset_name;
            }
            if export_frames {
                cfg.export_frames = true;
            }
            if bundle.is_some() {
                cfg.bundle_path = bundle;
            }

            init_logging(cfg.log_output_file.as_deref())?;
            log::info!("{cfg:?}");

            let tolerance = cfg.predictor.tolerance;
            let report = run_evaluation(&cfg, |_rank| Ok(RegionGrowPredictor::new(tolerance, Device::Cpu)))
                .context("evaluation failed")?;
            log::info!("evaluated {} volumes", report.bundle.metric.dim().0);
        }
        Commands::Summarize { bundle } => {
            init_logging(None)?;
            let loaded = MetricBundle::load(&bundle)
                .with_context(|| format!("loading bundle {}", bundle.display()))?;
            log::info!("metric shape {:?}", loaded.metric.dim());
            log_bundle_summary(&loaded);
        }
    }

    Ok(())
}
