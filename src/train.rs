use crate::config::{RunConfig, Split};
use crate::error::{Error, Result};
use crate::model::{ConvClassifier, Module};
use crate::optim::{normalized_cross_entropy, Adam, Optimizer};
use crate::pipeline::{Batch, Coordinator, InputPipeline};

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Where the training loop is; logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Stopping,
    Saved,
}

/// Owns the model and optimizer for the duration of a training run.
pub struct Trainer {
    model: ConvClassifier,
    optimizer: Adam,
    normalizer: f32,
}

impl Trainer {
    pub fn new(cfg: &RunConfig, model: ConvClassifier) -> Trainer {
        Trainer {
            model,
            optimizer: Adam::new(cfg.learning_rate),
            normalizer: cfg.loss_normalizer(),
        }
    }

    fn forward(&mut self, batch: &Batch) -> (Array2<f32>, Array2<f32>) {
        self.model.zero_grad();
        let logits = self
            .model
            .forward(batch.images.clone().into_dyn())
            .into_dimensionality::<Ix2>()
            .expect("Network output should be 2D: (batch_size, num_classes)");
        let labels = batch.labels.mapv(|l| l as f32);
        (logits, labels)
    }

    fn backward(&mut self, grad: Array2<f32>) {
        self.model.backward(grad.into_dyn());
        self.optimizer.step(&mut self.model);
    }

    /// Forward, backward and one Adam update. Returns the loss of the batch
    /// measured before the update.
    pub fn step_with_loss(&mut self, batch: &Batch) -> f32 {
        let (logits, labels) = self.forward(batch);
        let (loss, grad) = normalized_cross_entropy(&logits, &labels, self.normalizer);
        self.backward(grad);
        loss
    }

    pub fn model(&self) -> &ConvClassifier {
        &self.model
    }
}

/// Per-step loss, one `step,loss,duration` row per training step.
pub struct LossHistory {
    path: PathBuf,
    out: BufWriter<File>,
}

impl LossHistory {
    pub fn create(path: &Path) -> Result<LossHistory> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "step,loss,duration").map_err(|e| Error::io(path, e))?;
        Ok(LossHistory {
            path: path.to_path_buf(),
            out,
        })
    }

    pub fn record(&mut self, step: usize, loss: f32, duration: f64) -> Result<()> {
        writeln!(self.out, "{step},{loss},{duration:.6}").map_err(|e| Error::io(&self.path, e))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| Error::io(&self.path, e))
    }
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub steps: usize,
    /// Loss of the last step.
    pub last_loss: Option<f32>,
    /// Threads still running when the grace period ran out.
    pub abandoned_threads: usize,
}

fn set_phase(phase: &mut Phase, next: Phase) {
    tracing::debug!("train: {:?} -> {:?}", phase, next);
    *phase = next;
}

pub(crate) fn step_spinner(label: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner} {prefix} step {pos} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(label.to_string());
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// Train a fresh model on the train split until the epoch budget is used up.
///
/// The checkpoint is written when the loop stops, whether it ran out of data
/// or hit an error; an error is returned after the checkpoint is saved.
pub fn train(cfg: &RunConfig) -> Result<TrainSummary> {
    cfg.validate()?;
    let mut phase = Phase::Init;
    let mut history = LossHistory::create(&cfg.loss_history_path())?;
    let coord = Coordinator::new();
    let mut pipeline = InputPipeline::start(cfg, Split::Train, coord.clone())?;
    let mut trainer = Trainer::new(cfg, ConvClassifier::new(cfg.num_classes, cfg.seed));

    let pb = step_spinner("train");
    let mut step = 0;
    let mut last_loss = None;
    set_phase(&mut phase, Phase::Running);

    let outcome: Result<()> = loop {
        if coord.should_stop() {
            break coord.take_cause().map_or(Ok(()), Err);
        }
        let start_time = Instant::now();
        let batch = match pipeline.next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => break Ok(()),
            Err(err) => {
                coord.request_stop();
                break Err(err);
            }
        };

        let loss = trainer.step_with_loss(&batch);
        let duration = start_time.elapsed().as_secs_f64();
        if let Err(err) = history.record(step, loss, duration) {
            coord.request_stop();
            break Err(err);
        }
        if step % cfg.display_step == 0 {
            pb.suspend(|| tracing::info!("Step {step}: loss = {loss:.6} ({duration:.3} sec)"));
        }
        last_loss = Some(loss);
        step += 1;
        pb.inc(1);
    };

    set_phase(&mut phase, Phase::Stopping);
    if let Err(err) = &outcome {
        tracing::error!("training stopped early: {err}");
    }
    let abandoned_threads = pipeline.shutdown();
    pb.finish_and_clear();
    let flushed = history.flush();

    let saved = trainer.model().to_checkpoint(&cfg.checkpoint_path());
    if saved.is_ok() {
        set_phase(&mut phase, Phase::Saved);
        tracing::info!("Model saved to {}", cfg.checkpoint_path().display());
    }
    tracing::info!(
        "Finished train: {} epochs, {} steps.",
        cfg.num_epochs,
        step
    );

    outcome?;
    saved?;
    flushed?;
    Ok(TrainSummary {
        steps: step,
        last_loss,
        abandoned_threads,
    })
}
