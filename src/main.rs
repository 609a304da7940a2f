use anyhow::{Context, Result};
use clap::Parser;
use conv_mnist::run::{prepare_run_directory, run_experiment};
use conv_mnist::RunConfig;
use rand::Rng;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Train the convolutional MNIST classifier, then report valid and test accuracy.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Run identifier; outputs go to summaries/conv/run_<RUN_ID>/
    run_id: String,
    /// Labeled examples in the train shard (reads data/mnist_<LABELED>_train_labeled.records)
    labeled: usize,
}

/// Log to stdout and append the same lines to the run's log.txt.
fn init_logging(log_path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;
    let filter = EnvFilter::from_default_env().add_directive("conv_mnist=info".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let seed = rand::thread_rng().gen_range(1..1000);
    let cfg = RunConfig::for_run(cli.run_id, cli.labeled, seed);

    prepare_run_directory(&cfg).context("preparing run directory")?;
    init_logging(&cfg.run_directory().join("log.txt"))?;

    let summary = run_experiment(&cfg).context("experiment failed")?;
    tracing::info!(
        "Done: {} train steps, valid accuracy {:.4}, test accuracy {:.4}",
        summary.train.steps,
        summary.valid.accuracy,
        summary.test.accuracy
    );
    Ok(())
}
