use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Side length of the square MNIST images.
pub const IMAGE_DIM: usize = 28;
/// Number of pixels in one image.
pub const IMAGE_PIXELS: usize = IMAGE_DIM * IMAGE_DIM;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hyperparameters and paths for one experiment run.
///
/// Built once in `main` and handed out by reference; nothing mutates it
/// after the run starts.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunConfig {
    pub run_id: String,
    /// How many labeled examples the train shard was built from.
    pub labeled: usize,
    pub seed: u64,

    pub save_directory: PathBuf,
    pub model_directory: String,
    pub train_data: PathBuf,
    pub valid_data: PathBuf,
    pub test_data: PathBuf,

    pub image_dim: usize,
    pub num_classes: usize,
    pub batch_size: usize,
    pub display_step: usize,
    pub learning_rate: f32,
    pub num_epochs: usize,

    // input pipeline sizing
    pub examples_per_shard: usize,
    pub num_readers: usize,
    pub num_decoders: usize,
    pub stop_grace_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            run_id: "0".to_string(),
            labeled: 55_000,
            seed: 0,
            save_directory: PathBuf::from("summaries/"),
            model_directory: "conv/".to_string(),
            train_data: PathBuf::from("data/mnist_55000_train_labeled.records"),
            valid_data: PathBuf::from("data/mnist_valid.records"),
            test_data: PathBuf::from("data/mnist_test.records"),
            image_dim: IMAGE_DIM,
            num_classes: 10,
            batch_size: 100,
            display_step: 250,
            learning_rate: 1e-3,
            num_epochs: 100,
            examples_per_shard: 1024,
            num_readers: 4,
            num_decoders: 4,
            stop_grace_secs: 10,
        }
    }
}

impl RunConfig {
    /// Configuration for `conv-mnist <run_id> <labeled>`.
    pub fn for_run(run_id: impl Into<String>, labeled: usize, seed: u64) -> Self {
        RunConfig {
            run_id: run_id.into(),
            labeled,
            seed,
            train_data: PathBuf::from(format!("data/mnist_{labeled}_train_labeled.records")),
            ..Default::default()
        }
    }

    /// Directory holding this run's checkpoint, log and reports.
    pub fn run_directory(&self) -> PathBuf {
        self.save_directory
            .join(&self.model_directory)
            .join(format!("run_{}", self.run_id))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.run_directory().join("part_1.ckpt.json")
    }

    pub fn report_path(&self, split: Split) -> PathBuf {
        self.run_directory().join(format!("{split}_Accuracy.txt"))
    }

    pub fn data_path(&self, split: Split) -> &Path {
        match split {
            Split::Train => &self.train_data,
            Split::Valid => &self.valid_data,
            Split::Test => &self.test_data,
        }
    }

    /// Training walks the data `num_epochs` times, evaluation splits once.
    pub fn epochs_for(&self, split: Split) -> usize {
        match split {
            Split::Train => self.num_epochs,
            Split::Valid | Split::Test => 1,
        }
    }

    pub fn min_queue_examples(&self) -> usize {
        self.examples_per_shard * 16
    }

    pub fn shuffle_capacity(&self) -> usize {
        self.min_queue_examples() + 3 * self.batch_size
    }

    pub fn batch_capacity(&self) -> usize {
        2 * self.num_decoders * self.batch_size
    }

    pub fn loss_history_path(&self) -> PathBuf {
        self.run_directory().join("loss.csv")
    }

    /// Reject settings the training and eval loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("display_step", self.display_step),
            ("num_classes", self.num_classes),
            ("num_readers", self.num_readers),
            ("num_decoders", self.num_decoders),
            ("examples_per_shard", self.examples_per_shard),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be at least 1")));
        }
        if self.image_dim != IMAGE_DIM {
            return Err(Error::Config(format!(
                "image_dim is {}, records are {IMAGE_DIM}x{IMAGE_DIM}",
                self.image_dim
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// Denominator of the training loss.
    pub fn loss_normalizer(&self) -> f32 {
        (self.batch_size * self.image_dim * self.image_dim) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_sizing_follows_examples_per_shard() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.min_queue_examples(), 16_384);
        assert_eq!(cfg.shuffle_capacity(), 16_384 + 300);
        assert_eq!(cfg.batch_capacity(), 800);
    }

    #[test]
    fn run_paths() {
        let cfg = RunConfig::for_run("7", 100, 42);
        assert_eq!(
            cfg.train_data,
            PathBuf::from("data/mnist_100_train_labeled.records")
        );
        assert_eq!(
            cfg.report_path(Split::Valid),
            PathBuf::from("summaries/conv/run_7/valid_Accuracy.txt")
        );
        assert_eq!(cfg.epochs_for(Split::Test), 1);
        assert_eq!(cfg.epochs_for(Split::Train), 100);
        assert_eq!(
            cfg.loss_history_path(),
            PathBuf::from("summaries/conv/run_7/loss.csv")
        );
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for broken in [
            RunConfig { display_step: 0, ..Default::default() },
            RunConfig { batch_size: 0, ..Default::default() },
            RunConfig { num_readers: 0, ..Default::default() },
            RunConfig { num_decoders: 0, ..Default::default() },
        ] {
            assert!(matches!(broken.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn bad_learning_rate_and_image_size_are_rejected() {
        let cfg = RunConfig { learning_rate: f32::NAN, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        let cfg = RunConfig { image_dim: 32, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
