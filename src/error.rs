use std::path::PathBuf;

use thiserror::Error;

/// Problems found while framing or decoding a single record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("bad shard magic {found:?}")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported shard version {0}")]
    BadVersion(u32),
    #[error("record truncated: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("image holds {actual} bytes, expected {expected} ({floats} f32 values)")]
    ImageSize {
        actual: usize,
        expected: usize,
        floats: usize,
    },
    #[error("label has {actual} entries, expected {expected}")]
    LabelCount { actual: usize, expected: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record in {}: {source}", .path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: RecordError,
    },
    #[error("malformed record: {0}")]
    Decode(#[from] RecordError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("checkpoint: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("no shard files found for {}", .0.display())]
    NoShards(PathBuf),
    #[error("could not spawn pipeline thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("input pipeline cancelled")]
    Cancelled,
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
