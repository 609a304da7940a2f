use crate::config::{RunConfig, Split};
use crate::error::{Error, Result};
use crate::model::ConvClassifier;
use crate::pipeline::{Coordinator, InputPipeline};
use crate::train::step_spinner;

use ndarray::prelude::*;
use std::fs;
use std::path::Path;

/// Index of the first largest value, like numpy's argmax.
pub fn argmax<T: PartialOrd + Copy>(row: ArrayView1<T>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Per-example correctness, reduced to an accuracy at the end of a split.
#[derive(Debug, Default, Clone)]
pub struct AccuracyAccumulator {
    results: Vec<bool>,
}

impl AccuracyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare argmax of the predictions with argmax of the true labels.
    pub fn record(&mut self, probs: &Array2<f32>, labels: &Array2<i32>) {
        assert_eq!(probs.nrows(), labels.nrows(), "one label row per prediction");
        for (pred, truth) in probs.rows().into_iter().zip(labels.rows()) {
            self.results.push(argmax(pred) == argmax(truth));
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Fraction of correct predictions; NaN when nothing was recorded.
    pub fn accuracy(&self) -> f64 {
        if self.results.is_empty() {
            return f64::NAN;
        }
        self.results.iter().filter(|&&ok| ok).count() as f64 / self.results.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct EvalSummary {
    pub split: Split,
    pub accuracy: f64,
    pub examples: usize,
    pub steps: usize,
}

/// Text of the one-line accuracy report.
pub fn report_line(split: Split, accuracy: f64) -> String {
    format!("{split}set accuracy:{accuracy:?}")
}

pub fn write_report(path: &Path, split: Split, accuracy: f64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, report_line(split, accuracy)).map_err(|e| Error::io(path, e))
}

/// Restore the checkpoint and measure accuracy over one pass of `split`.
///
/// The report is written even when the pass stops on an error, covering the
/// examples seen so far; the error is returned afterwards.
pub fn evaluate(cfg: &RunConfig, split: Split) -> Result<EvalSummary> {
    cfg.validate()?;
    let mut model = ConvClassifier::from_checkpoint(&cfg.checkpoint_path())?;
    if model.num_classes() != cfg.num_classes {
        return Err(Error::Checkpoint(format!(
            "checkpoint has {} classes, run expects {}",
            model.num_classes(),
            cfg.num_classes
        )));
    }
    let coord = Coordinator::new();
    let mut pipeline = InputPipeline::start(cfg, split, coord.clone())?;

    let pb = step_spinner(split.as_str());
    let mut results = AccuracyAccumulator::new();
    let mut step = 0;

    let outcome: Result<()> = loop {
        if coord.should_stop() {
            break coord.take_cause().map_or(Ok(()), Err);
        }
        match pipeline.next_batch() {
            Ok(Some(batch)) => {
                let out = model.predict(&batch.images);
                results.record(&out.probs, &batch.labels);
                step += 1;
                pb.inc(1);
            }
            Ok(None) => break Ok(()),
            Err(err) => {
                coord.request_stop();
                break Err(err);
            }
        }
    };

    if let Err(err) = &outcome {
        tracing::error!("{split} evaluation stopped early: {err}");
    }
    pipeline.shutdown();
    pb.finish_and_clear();

    let accuracy = results.accuracy();
    tracing::info!("Accuracy on {split} Set: {accuracy:.6}");
    let written = write_report(&cfg.report_path(split), split, accuracy);
    tracing::info!(
        "Finished {split}: {} epochs, {} steps.",
        cfg.epochs_for(split),
        step
    );

    outcome?;
    written?;
    Ok(EvalSummary {
        split,
        accuracy,
        examples: results.len(),
        steps: step,
    })
}
