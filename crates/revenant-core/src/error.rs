/// Error taxonomy shared by every filesystem reader and scan pass
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("filesystem not loaded")]
    NotLoaded,

    #[error("filesystem already loaded")]
    AlreadyLoaded,

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("I/O error at offset {offset:#x}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("read of {len} bytes at {offset:#x} is outside the source ({size} bytes)")]
    OutOfRange { offset: u64, len: usize, size: u64 },

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("write failed after {written} bytes: {source}")]
    Write {
        written: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl FsError {
    pub fn io(offset: u64, source: std::io::Error) -> Self {
        FsError::Io { offset, source }
    }

    pub fn destination(path: &Path, source: std::io::Error) -> Self {
        FsError::Destination {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True for device-level read failures (as opposed to format or state errors)
    pub fn is_read_failure(&self) -> bool {
        matches!(self, FsError::Io { .. } | FsError::OutOfRange { .. })
    }
}
