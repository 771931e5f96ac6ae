//! Import errors.

use isaac_core::{EncodeError, SyncerError};
use isaac_storage::{DatabaseError, LocalFsError};
use isaac_types::{BlockItemType, Height, ValidationError};
use isaac_util::WorkerError;

/// Errors from importing blocks. Every error is fatal for the import.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    LocalFs(#[from] LocalFsError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The streamed item does not hash to the block map checksum.
    #[error("checksum mismatch of {item} at {height}: expected {expected}, got {got}")]
    Checksum {
        height: Height,
        item: BlockItemType,
        expected: String,
        got: String,
    },

    /// A block map lists an item the source does not have, or the source has
    /// no block at the height.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("wrong block map at {height}: {reason}")]
    WrongBlockMap { height: Height, reason: String },

    #[error("fetch: {0}")]
    Fetch(String),

    #[error("fetch timed out at {0}")]
    Timeout(Height),

    #[error("import canceled")]
    Canceled,
}

impl ImportError {
    /// Whether retrying the fetch that failed may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::Fetch(_) | ImportError::Timeout(_) | ImportError::Io(_)
        )
    }
}

impl From<ImportError> for SyncerError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Canceled | ImportError::Worker(WorkerError::ContextCanceled) => {
                SyncerError::Canceled
            }
            e => SyncerError::Failed(e.to_string()),
        }
    }
}
