//! Thicket trainer CLI
//!
//! Fits a gradient-boosted ensemble from a CSV dataset and writes the
//! model as canonical JSON next to its blake3 hash.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use thicket_core::{eval_by_name, objective_by_name, BoostConfig, BoostType, HistogramType};
use thicket_trainer::{Dataset, GbmTrainer, TrainOptions};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "thicket-train")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Histogram-based GBDT trainer", long_about = None)]
struct Args {
    /// Input CSV dataset (numeric columns, last column is the label)
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for the model and its hash
    #[arg(short, long, default_value = "models/thicket")]
    output: PathBuf,

    /// Objective function (square, logistic)
    #[arg(long, default_value = "square")]
    objective: String,

    /// Evaluation metric (rmse, mae, logloss, error)
    #[arg(long, default_value = "rmse")]
    eval: String,

    /// Boosting regime (gbtree, dart)
    #[arg(long, default_value = "gbtree")]
    boost_type: String,

    /// Number of boosting iterations
    #[arg(long, default_value = "20")]
    iterations: usize,

    /// Maximum tree depth
    #[arg(long, default_value = "5")]
    max_depth: u32,

    /// Maximum bins per column
    #[arg(long, default_value = "256")]
    max_bins: u32,

    /// Shrinkage per tree
    #[arg(long, default_value = "0.1")]
    step_size: f64,

    /// Histogram strategy (basic, subtract, vote)
    #[arg(long, default_value = "basic")]
    histogram: String,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: i64,

    /// Number of data partitions (defaults to the worker thread count)
    #[arg(long)]
    partitions: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Thicket GBDT trainer v{}", env!("CARGO_PKG_VERSION"));

    info!("loading dataset from {}", args.input.display());
    let dataset = Dataset::from_csv(&args.input).context("failed to load dataset")?;
    info!(
        "loaded {} rows with {} features",
        dataset.len(),
        dataset.col_kinds.len()
    );

    let config = BoostConfig {
        boost_type: match args.boost_type.as_str() {
            "gbtree" => BoostType::GbTree,
            "dart" => BoostType::Dart,
            other => anyhow::bail!("unknown boost type `{other}`"),
        },
        max_iter: args.iterations,
        max_depth: args.max_depth,
        max_bins: args.max_bins,
        step_size: args.step_size,
        histogram_type: match args.histogram.as_str() {
            "basic" => HistogramType::Basic,
            "subtract" => HistogramType::Subtract,
            "vote" => HistogramType::Vote,
            other => anyhow::bail!("unknown histogram strategy `{other}`"),
        },
        seed: args.seed,
        ..BoostConfig::default()
    };

    let objective = objective_by_name(&args.objective)
        .with_context(|| format!("unknown objective `{}`", args.objective))?;
    let eval = eval_by_name(&args.eval)?;
    let mut options = TrainOptions::default();
    if let Some(partitions) = args.partitions {
        options.num_partitions = partitions;
    }

    info!("starting training");
    let mut trainer = GbmTrainer::new(config, objective)
        .with_options(options)
        .with_eval(eval);
    let model = trainer.fit(&dataset, None).context("training failed")?;

    std::fs::create_dir_all(&args.output).context("failed to create output directory")?;
    let model_path = args.output.join("model.json");
    model
        .save_json(&model_path)
        .context("failed to write model")?;

    let hash = model.hash_hex().context("failed to hash model")?;
    let hash_path = args.output.join("model.hash");
    std::fs::write(&hash_path, &hash).context("failed to write hash")?;

    info!("model written to {}", model_path.display());
    info!("model hash {hash}");

    Ok(())
}
