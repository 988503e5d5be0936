use crate::types::{Fingerprint, Timestamp};
use thiserror::Error;

/// A convenience `Result` type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error type for all storage core operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A sample arrived with a timestamp older than the last accepted sample
    /// of its series. The sample is rejected; the series stays usable.
    #[error("out-of-order sample for series {fingerprint}: got {timestamp}, last accepted {last_timestamp}")]
    OutOfOrder {
        fingerprint: Fingerprint,
        timestamp: Timestamp,
        last_timestamp: Timestamp,
    },

    /// The fingerprint is neither in memory nor known to the index.
    #[error("unknown fingerprint: {0}")]
    UnknownFingerprint(Fingerprint),

    /// A metric carried a label name the engine refuses to store.
    #[error("invalid label name: {0:?}")]
    InvalidLabel(String),

    /// Some samples of a batch were rejected; the rest were appended.
    /// `errors` holds the offending batch positions with their causes.
    #[error("{} of {total} samples rejected", errors.len())]
    PartialAppend {
        total: usize,
        errors: Vec<(usize, StorageError)>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk data failed validation (bad magic, checksum, variant tag, or
    /// non-monotonic timestamps inside a chunk).
    #[error("corruption detected: {details}")]
    Corruption {
        details: String,
        fingerprint: Option<Fingerprint>,
        timestamp: Option<Timestamp>,
    },

    /// A preload request could not pin all requested chunks before its
    /// deadline. All pins taken by the request have been rolled back.
    #[error("preload deadline of {0:?} exceeded")]
    PreloadDeadlineExceeded(std::time::Duration),

    /// The persist queue receiver is gone; the engine is shutting down.
    #[error("persist queue disconnected")]
    PersistQueueClosed,

    #[error("operation on closed storage")]
    Closed,

    #[error("lock poisoned: {0}")]
    Lock(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A sample cannot be represented by the requested chunk encoding.
    #[error("chunk encoding error: {0}")]
    Encoding(String),

    #[error("background task error: {0}")]
    Background(String),
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StorageError::Lock(format!("mutex/rwlock poisoned: {}", err))
    }
}
