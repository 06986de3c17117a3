use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures surfaced by the storage, repository and scheduler layers.
///
/// Claim contention and "no task available" are not errors; they are reported
/// through `ClaimOutcome::Contended` and `Ok(None)` respectively.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Document not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invalid frame range: {0}")]
    InvalidFrameRange(String),

    #[error("`{0}` is a built-in job field and cannot be set as an extra field")]
    ReservedField(String),
}

impl QueueError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> QueueError + '_ {
        move |source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                QueueError::NotFound(path.to_path_buf())
            } else {
                QueueError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
