//! Threaded input pipeline: shard files are read by a pool of reader
//! threads into a shuffle queue, a pool of decode threads turns raw records
//! into examples, and the step loop pulls fixed-size batches.
pub mod coordinator;
pub mod queue;

pub use coordinator::Coordinator;
pub use queue::{BoundedQueue, Order};

use crate::config::{RunConfig, Split};
use crate::error::{Error, Result};
use crate::record::{decode_example, list_shards, Example, ShardReader};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A batch of examples, images in NCHW layout.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>, // (batch_size, 1, 28, 28)
    pub labels: Array2<i32>, // (batch_size, num_classes)
}

impl Batch {
    pub fn from_examples(examples: &[Example]) -> Batch {
        assert!(!examples.is_empty(), "a batch needs at least one example");
        // (h, w, c) -> (c, h, w)
        let images: Vec<_> = examples
            .iter()
            .map(|ex| ex.image.view().permuted_axes([2, 0, 1]))
            .collect();
        let labels: Vec<_> = examples.iter().map(|ex| ex.label.view()).collect();
        Batch {
            images: ndarray::stack(Axis(0), &images).expect("examples share one image shape"),
            labels: ndarray::stack(Axis(0), &labels).expect("examples share one label length"),
        }
    }

    pub fn len(&self) -> usize {
        self.images.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Closes `queue` when the last of a group of workers exits, even on panic.
struct LastOneCloses<T> {
    remaining: Arc<AtomicUsize>,
    queue: Arc<BoundedQueue<T>>,
}

impl<T> Drop for LastOneCloses<T> {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.close();
        }
    }
}

pub struct InputPipeline {
    split: Split,
    coord: Coordinator,
    batches: Arc<BoundedQueue<Example>>,
    workers: Vec<JoinHandle<()>>,
    batch_size: usize,
    allow_smaller_final_batch: bool,
    grace: Duration,
}

impl InputPipeline {
    /// Start reader and decode threads for `split`.
    ///
    /// Every shard is opened once up front so missing or foreign files fail
    /// here instead of inside a worker.
    pub fn start(cfg: &RunConfig, split: Split, coord: Coordinator) -> Result<InputPipeline> {
        let shards = list_shards(cfg.data_path(split))?;
        for shard in &shards {
            ShardReader::open(shard)?;
        }

        let epochs = cfg.epochs_for(split);
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut files = VecDeque::with_capacity(shards.len() * epochs);
        for _ in 0..epochs {
            let mut order = shards.clone();
            order.shuffle(&mut rng);
            files.extend(order);
        }
        let files = Arc::new(Mutex::new(files));

        let shuffle = Arc::new(BoundedQueue::new(
            cfg.shuffle_capacity(),
            cfg.min_queue_examples(),
            Order::Random(StdRng::seed_from_u64(cfg.seed.wrapping_add(1))),
            coord.clone(),
        ));
        let batches = Arc::new(BoundedQueue::fifo(cfg.batch_capacity(), coord.clone()));

        tracing::debug!(
            split = %split,
            shards = shards.len(),
            epochs,
            capacity = cfg.shuffle_capacity(),
            min_fill = cfg.min_queue_examples(),
            "starting input pipeline"
        );

        let mut workers = Vec::with_capacity(cfg.num_readers + cfg.num_decoders);

        let readers_left = Arc::new(AtomicUsize::new(cfg.num_readers));
        for i in 0..cfg.num_readers {
            let guard = LastOneCloses {
                remaining: readers_left.clone(),
                queue: shuffle.clone(),
            };
            let files = files.clone();
            let worker_coord = coord.clone();
            let handle = thread::Builder::new()
                .name(format!("{split}-reader-{i}"))
                .spawn(move || read_shards(files, guard, worker_coord));
            workers.push(Self::spawned(handle, &coord)?);
        }

        let decoders_left = Arc::new(AtomicUsize::new(cfg.num_decoders));
        for i in 0..cfg.num_decoders {
            let guard = LastOneCloses {
                remaining: decoders_left.clone(),
                queue: batches.clone(),
            };
            let shuffle = shuffle.clone();
            let worker_coord = coord.clone();
            let num_classes = cfg.num_classes;
            let handle = thread::Builder::new()
                .name(format!("{split}-decoder-{i}"))
                .spawn(move || decode_records(shuffle, guard, worker_coord, num_classes));
            workers.push(Self::spawned(handle, &coord)?);
        }

        Ok(InputPipeline {
            split,
            coord,
            batches,
            workers,
            batch_size: cfg.batch_size,
            allow_smaller_final_batch: split != Split::Train,
            grace: Duration::from_secs(cfg.stop_grace_secs),
        })
    }

    fn spawned(handle: std::io::Result<JoinHandle<()>>, coord: &Coordinator) -> Result<JoinHandle<()>> {
        handle.map_err(|e| {
            coord.request_stop();
            Error::Spawn(e)
        })
    }

    /// Next batch, `Ok(None)` once the epoch budget is used up.
    ///
    /// Training drops a final partial batch; evaluation splits keep it.
    pub fn next_batch(&self) -> Result<Option<Batch>> {
        match self
            .batches
            .dequeue_many(self.batch_size, self.allow_smaller_final_batch)
        {
            Ok(Some(examples)) => Ok(Some(Batch::from_examples(&examples))),
            Ok(None) => match self.coord.take_cause() {
                Some(err) => Err(err),
                None => Ok(None),
            },
            Err(Error::Cancelled) => Err(self.coord.take_cause().unwrap_or(Error::Cancelled)),
            Err(err) => Err(err),
        }
    }

    /// Stop all workers, waiting at most the configured grace period.
    ///
    /// Returns the number of threads left running.
    pub fn shutdown(&mut self) -> usize {
        let workers = std::mem::take(&mut self.workers);
        if workers.is_empty() {
            return 0;
        }
        tracing::debug!(split = %self.split, "stopping input pipeline");
        self.coord.join(workers, self.grace)
    }
}

impl Drop for InputPipeline {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.coord.request_stop();
        }
    }
}

fn read_shards(
    files: Arc<Mutex<VecDeque<PathBuf>>>,
    guard: LastOneCloses<Vec<u8>>,
    coord: Coordinator,
) {
    let shuffle = guard.queue.clone();
    while !coord.should_stop() {
        let next = files.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some(path) = next else {
            break;
        };
        let reader = match ShardReader::open(&path) {
            Ok(reader) => reader,
            Err(err) => {
                coord.request_stop_with(err);
                return;
            }
        };
        for payload in reader {
            match payload {
                Ok(raw) => {
                    if shuffle.enqueue(raw).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!("reading {}: {err}", path.display());
                    coord.request_stop_with(err);
                    return;
                }
            }
        }
    }
}

fn decode_records(
    shuffle: Arc<BoundedQueue<Vec<u8>>>,
    guard: LastOneCloses<Example>,
    coord: Coordinator,
    num_classes: usize,
) {
    let batches = guard.queue.clone();
    loop {
        let raw = match shuffle.dequeue() {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(_) => return,
        };
        match decode_example(&raw, num_classes) {
            Ok(example) => {
                if batches.enqueue(example).is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::error!("decoding record: {err}");
                coord.request_stop_with(err.into());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IMAGE_PIXELS;
    use crate::record::{Record, ShardWriter};
    use std::path::Path;

    fn small_config(dir: &Path, batch_size: usize, epochs: usize) -> RunConfig {
        RunConfig {
            train_data: dir.join("train.records"),
            valid_data: dir.join("train.records"),
            test_data: dir.join("train.records"),
            batch_size,
            num_epochs: epochs,
            examples_per_shard: 1,
            seed: 3,
            ..Default::default()
        }
    }

    fn write_shard(path: &Path, n: usize) {
        let mut writer = ShardWriter::create(path).unwrap();
        for i in 0..n {
            let image = vec![(i % 2) as f32; IMAGE_PIXELS];
            writer.write(&Record::mnist(image, i % 10, 10)).unwrap();
        }
        writer.finish().unwrap();
    }

    fn drain(pipeline: &InputPipeline) -> Vec<Batch> {
        std::iter::from_fn(|| pipeline.next_batch().unwrap()).collect()
    }

    #[test]
    fn batches_have_nchw_layout() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(&dir.path().join("train.records"), 8);
        let cfg = small_config(dir.path(), 4, 1);

        let mut pipeline = InputPipeline::start(&cfg, Split::Train, Coordinator::new()).unwrap();
        let batches = drain(&pipeline);
        assert_eq!(pipeline.shutdown(), 0);

        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.images.shape(), &[4, 1, 28, 28]);
            assert_eq!(batch.labels.shape(), &[4, 10]);
            for (image, label) in batch.images.outer_iter().zip(batch.labels.outer_iter()) {
                // odd classes were written with white images
                let class = label.iter().position(|&l| l == 1).unwrap();
                let expected = if class % 2 == 1 { 1.0 } else { -1.0 };
                assert!(image.iter().all(|&px| px == expected));
            }
        }
    }

    #[test]
    fn every_epoch_is_read() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(&dir.path().join("train.records"), 6);
        let cfg = small_config(dir.path(), 3, 3);

        let mut pipeline = InputPipeline::start(&cfg, Split::Train, Coordinator::new()).unwrap();
        let total: usize = drain(&pipeline).iter().map(Batch::len).sum();
        pipeline.shutdown();
        assert_eq!(total, 18);
    }

    #[test]
    fn eval_split_keeps_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(&dir.path().join("train.records"), 5);
        let cfg = small_config(dir.path(), 2, 1);

        let mut train = InputPipeline::start(&cfg, Split::Train, Coordinator::new()).unwrap();
        let sizes: Vec<usize> = drain(&train).iter().map(Batch::len).collect();
        train.shutdown();
        assert_eq!(sizes, vec![2, 2]);

        let mut valid = InputPipeline::start(&cfg, Split::Valid, Coordinator::new()).unwrap();
        let total: usize = drain(&valid).iter().map(Batch::len).sum();
        valid.shutdown();
        assert_eq!(total, 5);
    }

    #[test]
    fn malformed_record_stops_with_cause() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.records");
        let mut writer = ShardWriter::create(&path).unwrap();
        let mut bad = Record::mnist(vec![0.0; IMAGE_PIXELS], 1, 10);
        bad.image.truncate(100);
        writer.write(&bad).unwrap();
        writer.finish().unwrap();
        let cfg = small_config(dir.path(), 1, 1);

        let mut pipeline = InputPipeline::start(&cfg, Split::Train, Coordinator::new()).unwrap();
        let err = loop {
            match pipeline.next_batch() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("pipeline ended without reporting the bad record"),
                Err(err) => break err,
            }
        };
        pipeline.shutdown();
        assert!(matches!(err, Error::Decode(_)), "got {err:?}");
    }

    #[test]
    fn missing_split_fails_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_config(dir.path(), 1, 1);
        assert!(matches!(
            InputPipeline::start(&cfg, Split::Test, Coordinator::new()),
            Err(Error::NoShards(_))
        ));
    }
}
