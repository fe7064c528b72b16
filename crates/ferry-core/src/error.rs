use std::path::PathBuf;

use thiserror::Error;

use crate::domain::JobId;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transfer scheduler rejected request: {0}")]
    Scheduler(String),

    #[error("batch system error: {0}")]
    Batch(String),

    #[error("{0}")]
    Other(String),
}

impl FerryError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
