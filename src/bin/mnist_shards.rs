//! Convert the MNIST idx files into the shard files read by `conv-mnist`.
use anyhow::{bail, Context, Result};
use clap::Parser;
use conv_mnist::config::IMAGE_PIXELS;
use conv_mnist::record::{Record, ShardWriter};
use mnist::MnistBuilder;
use std::path::PathBuf;

const NUM_CLASSES: usize = 10;
const TRAIN_IMAGES: usize = 55_000;
const VALID_IMAGES: usize = 5_000;
const TEST_IMAGES: usize = 10_000;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Folder holding the train/t10k idx-ubyte files
    #[arg(long, default_value = "MNIST_data/")]
    mnist_dir: String,
    /// Where to write the shards
    #[arg(long, default_value = "data/")]
    out_dir: PathBuf,
    /// Labeled training examples to keep, split evenly over the classes
    #[arg(long, default_value_t = 55_000)]
    labeled: usize,
}

fn to_record(pixels: &[u8], label: u8) -> Record {
    let image = pixels.iter().map(|&p| p as f32 / 255.0).collect();
    Record::mnist(image, label as usize, NUM_CLASSES)
}

/// Pick `labeled / 10` examples of each class in file order; the first
/// `labeled % 10` classes get one extra.
fn select_labeled(labels: &[u8], labeled: usize) -> Vec<usize> {
    if labeled >= labels.len() {
        return (0..labels.len()).collect();
    }
    let quota: Vec<usize> = (0..NUM_CLASSES)
        .map(|c| labeled / NUM_CLASSES + usize::from(c < labeled % NUM_CLASSES))
        .collect();
    let mut taken = [0usize; NUM_CLASSES];
    let mut picked = Vec::with_capacity(labeled);
    for (i, &l) in labels.iter().enumerate() {
        let c = l as usize;
        if taken[c] < quota[c] {
            taken[c] += 1;
            picked.push(i);
        }
    }
    picked
}

fn write_split(path: PathBuf, images: &[u8], labels: &[u8], indices: impl Iterator<Item = usize>) -> Result<usize> {
    let mut writer = ShardWriter::create(&path)?;
    for i in indices {
        let pixels = &images[i * IMAGE_PIXELS..(i + 1) * IMAGE_PIXELS];
        writer.write(&to_record(pixels, labels[i]))?;
    }
    let n = writer.finish()?;
    println!("wrote {n} records to {}", path.display());
    Ok(n)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.labeled < NUM_CLASSES {
        bail!("--labeled must be at least {NUM_CLASSES}");
    }

    let mnist = MnistBuilder::new()
        .base_path(&cli.mnist_dir)
        .training_set_length((TRAIN_IMAGES + VALID_IMAGES) as u32)
        .test_set_length(TEST_IMAGES as u32)
        .finalize();

    let train_labels = &mnist.trn_lbl[..TRAIN_IMAGES];
    let picked = select_labeled(train_labels, cli.labeled);
    if picked.len() != cli.labeled.min(TRAIN_IMAGES) {
        bail!(
            "only found {} of the {} requested labeled examples",
            picked.len(),
            cli.labeled
        );
    }
    write_split(
        cli.out_dir
            .join(format!("mnist_{}_train_labeled.records", cli.labeled)),
        &mnist.trn_img,
        &mnist.trn_lbl,
        picked.into_iter(),
    )
    .context("writing train shard")?;

    write_split(
        cli.out_dir.join("mnist_valid.records"),
        &mnist.trn_img,
        &mnist.trn_lbl,
        TRAIN_IMAGES..TRAIN_IMAGES + VALID_IMAGES,
    )
    .context("writing valid shard")?;

    write_split(
        cli.out_dir.join("mnist_test.records"),
        &mnist.tst_img,
        &mnist.tst_lbl,
        0..TEST_IMAGES,
    )
    .context("writing test shard")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_subset_is_balanced() {
        let labels: Vec<u8> = (0..200).map(|i| (i % 10) as u8).collect();
        let picked = select_labeled(&labels, 30);
        assert_eq!(picked.len(), 30);
        for class in 0..10u8 {
            assert_eq!(picked.iter().filter(|&&i| labels[i] == class).count(), 3);
        }
    }

    #[test]
    fn remainder_is_spread_over_the_first_classes() {
        let labels: Vec<u8> = (0..200).map(|i| (i % 10) as u8).collect();
        let picked = select_labeled(&labels, 25);
        assert_eq!(picked.len(), 25);
        for class in 0..10u8 {
            let expected = if class < 5 { 3 } else { 2 };
            assert_eq!(picked.iter().filter(|&&i| labels[i] == class).count(), expected);
        }
    }
}
