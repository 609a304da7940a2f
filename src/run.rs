use crate::config::{RunConfig, Split};
use crate::error::{Error, Result};
use crate::eval::{evaluate, EvalSummary};
use crate::train::{train, TrainSummary};
use std::fs;

#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub train: TrainSummary,
    pub valid: EvalSummary,
    pub test: EvalSummary,
}

/// Write the configuration next to the run's checkpoint and reports.
pub fn prepare_run_directory(cfg: &RunConfig) -> Result<()> {
    let dir = cfg.run_directory();
    fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    let path = dir.join("config.json");
    let json = serde_json::to_string_pretty(cfg)?;
    fs::write(&path, json).map_err(|e| Error::io(&path, e))
}

/// Train, then evaluate the saved checkpoint on the valid and test splits.
pub fn run_experiment(cfg: &RunConfig) -> Result<ExperimentSummary> {
    prepare_run_directory(cfg)?;
    tracing::info!("Seed: {}", cfg.seed);
    tracing::info!("Number of Labeled: {}", cfg.labeled);

    let train = train(cfg)?;
    let valid = evaluate(cfg, Split::Valid)?;
    let test = evaluate(cfg, Split::Test)?;
    Ok(ExperimentSummary { train, valid, test })
}
