//! Shard files and the records inside them.
//!
//! A shard starts with `b"MNRC"` and a little-endian `u32` version, then holds
//! length-prefixed record payloads:
//!
//! ```text
//! frame   := len(u64) payload[len]
//! payload := height(i64) width(i64) depth(i64)
//!            n_labels(u32) label(i64) * n_labels
//!            n_image_bytes(u32) image_bytes
//! ```
use crate::config::{IMAGE_DIM, IMAGE_PIXELS};
use crate::error::{Error, RecordError, Result};
use ndarray::prelude::*;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: [u8; 4] = *b"MNRC";
pub const VERSION: u32 = 1;
pub const SHARD_EXTENSION: &str = "records";

/// One persisted example, as written to a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub image: Vec<f32>, // 784 pixels, row-major, in [0, 1]
    pub label: Vec<i64>, // one-hot, empty when unlabeled
    pub height: i64,
    pub width: i64,
    pub depth: i64,
}

impl Record {
    /// A 28x28x1 record with a one-hot label.
    pub fn mnist(image: Vec<f32>, class: usize, num_classes: usize) -> Record {
        let mut label = vec![0; num_classes];
        label[class] = 1;
        Record {
            image,
            label,
            height: IMAGE_DIM as i64,
            width: IMAGE_DIM as i64,
            depth: 1,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 * 8 + 4 + self.label.len() * 8 + 4 + self.image.len() * 4);
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.depth.to_le_bytes());
        out.extend_from_slice(&(self.label.len() as u32).to_le_bytes());
        for l in &self.label {
            out.extend_from_slice(&l.to_le_bytes());
        }
        out.extend_from_slice(&((self.image.len() * 4) as u32).to_le_bytes());
        for px in &self.image {
            out.extend_from_slice(&px.to_le_bytes());
        }
        out
    }
}

/// A decoded example ready for batching.
#[derive(Debug, Clone)]
pub struct Example {
    pub image: Array3<f32>, // (28, 28, 1)
    pub label: Array1<i32>, // (num_classes)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], RecordError> {
        if self.buf.len() - self.pos < n {
            return Err(RecordError::Truncated {
                offset: self.pos,
                needed: n - (self.buf.len() - self.pos),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn i64(&mut self) -> std::result::Result<i64, RecordError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn u32(&mut self) -> std::result::Result<u32, RecordError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }
}

/// Parse one record payload into a normalized image and its label vector.
///
/// Pixels are rescaled with `(x - 0.5) * 2` so [0, 1] inputs land in [-1, 1].
/// A missing label decodes as `num_classes` entries of -1.
pub fn decode_example(payload: &[u8], num_classes: usize) -> std::result::Result<Example, RecordError> {
    let mut cur = Cursor { buf: payload, pos: 0 };
    // height, width and depth must be present but the image is always 28x28x1
    let _height = cur.i64()?;
    let _width = cur.i64()?;
    let _depth = cur.i64()?;

    let n_labels = cur.u32()? as usize;
    let label = match n_labels {
        0 => Array1::from_elem(num_classes, -1),
        n if n == num_classes => {
            let mut label = Array1::zeros(num_classes);
            for l in label.iter_mut() {
                *l = cur.i64()? as i32;
            }
            label
        }
        n => {
            return Err(RecordError::LabelCount {
                actual: n,
                expected: num_classes,
            })
        }
    };

    let n_bytes = cur.u32()? as usize;
    if n_bytes != IMAGE_PIXELS * 4 {
        return Err(RecordError::ImageSize {
            actual: n_bytes,
            expected: IMAGE_PIXELS * 4,
            floats: IMAGE_PIXELS,
        });
    }
    let raw = cur.take(n_bytes)?;
    let pixels: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| (f32::from_le_bytes(b.try_into().expect("4 bytes")) - 0.5) * 2.0)
        .collect();
    let image = Array3::from_shape_vec((IMAGE_DIM, IMAGE_DIM, 1), pixels)
        .expect("784 pixels always fit a 28x28x1 image");

    Ok(Example { image, label })
}

pub struct ShardWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl ShardWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<ShardWriter> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        let mut out = BufWriter::new(file);
        out.write_all(&MAGIC)
            .and_then(|_| out.write_all(&VERSION.to_le_bytes()))
            .map_err(|e| Error::io(&path, e))?;
        Ok(ShardWriter {
            path,
            out,
            written: 0,
        })
    }

    pub fn write(&mut self, record: &Record) -> Result<()> {
        let payload = record.encode();
        self.write_raw(&payload)
    }

    /// Write an already encoded payload.
    pub fn write_raw(&mut self, payload: &[u8]) -> Result<()> {
        self.out
            .write_all(&(payload.len() as u64).to_le_bytes())
            .and_then(|_| self.out.write_all(payload))
            .map_err(|e| Error::io(&self.path, e))?;
        self.written += 1;
        Ok(())
    }

    /// Flush and return how many records were written.
    pub fn finish(mut self) -> Result<usize> {
        self.out.flush().map_err(|e| Error::io(&self.path, e))?;
        Ok(self.written)
    }
}

/// Sequential reader over the raw payloads of one shard.
pub struct ShardReader {
    path: PathBuf,
    input: BufReader<File>,
    offset: usize,
    file_len: u64,
}

impl ShardReader {
    pub fn open(path: impl AsRef<Path>) -> Result<ShardReader> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let file_len = file.metadata().map_err(|e| Error::io(&path, e))?.len();
        let mut input = BufReader::new(file);

        let mut header = [0u8; 8];
        input.read_exact(&mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::Record {
                path: path.clone(),
                source: RecordError::Truncated { offset: 0, needed: 8 },
            },
            _ => Error::io(&path, e),
        })?;
        let magic: [u8; 4] = header[..4].try_into().expect("4 bytes");
        if magic != MAGIC {
            return Err(Error::Record {
                path,
                source: RecordError::BadMagic { found: magic },
            });
        }
        let version = u32::from_le_bytes(header[4..].try_into().expect("4 bytes"));
        if version != VERSION {
            return Err(Error::Record {
                path,
                source: RecordError::BadVersion(version),
            });
        }

        Ok(ShardReader {
            path,
            input,
            offset: 8,
            file_len,
        })
    }

    /// Next raw payload, `Ok(None)` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len = [0u8; 8];
        match read_full(&mut self.input, &mut len) {
            Ok(0) => return Ok(None),
            Ok(8) => {}
            Ok(n) => {
                return Err(self.truncated(8 - n));
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        }
        self.offset += 8;

        // a frame can never be longer than what is left of the file
        let len = u64::from_le_bytes(len);
        let remaining = self.file_len.saturating_sub(self.offset as u64);
        if len > remaining {
            return Err(self.truncated(usize::try_from(len - remaining).unwrap_or(usize::MAX)));
        }
        let len = len as usize;
        let mut payload = vec![0u8; len];
        let n = read_full(&mut self.input, &mut payload).map_err(|e| Error::io(&self.path, e))?;
        if n < len {
            return Err(self.truncated(len - n));
        }
        self.offset += len;
        Ok(Some(payload))
    }

    fn truncated(&self, needed: usize) -> Error {
        Error::Record {
            path: self.path.clone(),
            source: RecordError::Truncated {
                offset: self.offset,
                needed,
            },
        }
    }
}

impl Iterator for ShardReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

// read_exact that reports how much it got instead of failing on EOF
fn read_full(input: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Expand a split path into its shard files.
///
/// A file is its own single shard; a directory contributes every
/// `*.records` file inside it, sorted by name.
pub fn list_shards(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let mut shards = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| Error::io(path, e))? {
            let entry = entry.map_err(|e| Error::io(path, e))?;
            let p = entry.path();
            if p.is_file() && p.extension().is_some_and(|ext| ext == SHARD_EXTENSION) {
                shards.push(p);
            }
        }
        shards.sort();
        if shards.is_empty() {
            return Err(Error::NoShards(path.to_path_buf()));
        }
        Ok(shards)
    } else if path.is_file() {
        Ok(vec![path.to_path_buf()])
    } else {
        Err(Error::NoShards(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image() -> Vec<f32> {
        (0..IMAGE_PIXELS).map(|i| i as f32 / (IMAGE_PIXELS - 1) as f32).collect()
    }

    #[test]
    fn decodes_to_28x28x1_in_unit_range() {
        let record = Record::mnist(gradient_image(), 3, 10);
        let ex = decode_example(&record.encode(), 10).unwrap();

        assert_eq!(ex.image.shape(), &[28, 28, 1]);
        assert_eq!(ex.image.len(), 784);
        assert!(ex.image.iter().all(|&x| (-1.0..=1.0).contains(&x)));
        assert_eq!(ex.image[[0, 0, 0]], -1.0);
        assert_eq!(ex.image[[27, 27, 0]], 1.0);
        assert_eq!(ex.label.to_vec(), vec![0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn wrong_image_length_fails() {
        let mut record = Record::mnist(gradient_image(), 0, 10);
        record.image.pop();
        let err = decode_example(&record.encode(), 10).unwrap_err();
        assert_eq!(
            err,
            RecordError::ImageSize {
                actual: 783 * 4,
                expected: 784 * 4,
                floats: 784
            }
        );
    }

    #[test]
    fn missing_label_is_filled_with_minus_one() {
        let mut record = Record::mnist(gradient_image(), 0, 10);
        record.label.clear();
        let ex = decode_example(&record.encode(), 10).unwrap();
        assert!(ex.label.iter().all(|&l| l == -1));
        assert_eq!(ex.label.len(), 10);
    }

    #[test]
    fn short_label_and_truncation_fail() {
        let mut record = Record::mnist(gradient_image(), 0, 10);
        record.label.truncate(4);
        assert!(matches!(
            decode_example(&record.encode(), 10),
            Err(RecordError::LabelCount { actual: 4, expected: 10 })
        ));

        let payload = Record::mnist(gradient_image(), 0, 10).encode();
        assert!(matches!(
            decode_example(&payload[..payload.len() - 1], 10),
            Err(RecordError::Truncated { .. })
        ));
    }

    #[test]
    fn shard_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.records");
        let mut writer = ShardWriter::create(&path).unwrap();
        for class in 0..3 {
            writer.write(&Record::mnist(gradient_image(), class, 10)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        let payloads: Vec<Vec<u8>> = ShardReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(payloads.len(), 3);
        let ex = decode_example(&payloads[2], 10).unwrap();
        assert_eq!(ex.label[2], 1);
    }

    #[test]
    fn truncated_shard_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.records");
        let mut writer = ShardWriter::create(&path).unwrap();
        writer.write(&Record::mnist(gradient_image(), 1, 10)).unwrap();
        writer.finish().unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let mut reader = ShardReader::open(&path).unwrap();
        assert!(matches!(reader.next_record(), Err(Error::Record { .. })));
    }

    #[test]
    fn oversized_frame_length_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.records");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&path, &bytes).unwrap();

        let mut reader = ShardReader::open(&path).unwrap();
        match reader.next_record() {
            Err(Error::Record {
                source: RecordError::Truncated { offset, .. },
                ..
            }) => assert_eq!(offset, 16),
            other => panic!("expected a truncated frame, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.records");
        fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(matches!(
            ShardReader::open(&path),
            Err(Error::Record {
                source: RecordError::BadMagic { .. },
                ..
            })
        ));
    }

    #[test]
    fn directory_lists_record_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.records", "a.records", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let shards = list_shards(dir.path()).unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.records", "b.records"]);

        assert!(matches!(
            list_shards(&dir.path().join("missing")),
            Err(Error::NoShards(_))
        ));
    }
}
