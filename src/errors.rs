//! State Machine Execution Core Error Hierarchy
//!
//! Defines the error types for the state machine execution layer,
//! categorized by operational concern: storage engine failures, snapshot
//! save/recover failures, and entry application failures.

use std::path::PathBuf;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage engine failures (embedded database, serialization, disk I/O)
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Snapshot save/recover failures
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Entry application failures. Always fatal to the state machine
    /// instance: partial application would break determinism across
    /// replicas.
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No builder registered for the requested group
    #[error("No state machine builder registered for group {0}")]
    BuilderMissing(u64),

    /// A builder is already registered for the group
    #[error("State machine builder already registered for group {0}")]
    BuilderExists(u64),

    /// Kind-specific operation invoked on the wrong state machine kind
    #[error("Operation {op} is not supported by the {kind} state machine kind")]
    Unsupported { op: &'static str, kind: &'static str },

    /// Unrecoverable failures requiring replica shutdown
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// The operation was aborted cooperatively; no state was corrupted and
    /// the host may retry the whole operation from scratch.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Snapshot(SnapshotError::Cancelled))
    }

    /// Recovered bytes failed validation. Not locally recoverable: the host
    /// must fall back to another snapshot source or full resynchronization.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Error::Snapshot(SnapshotError::Corrupt { .. }) | Error::Snapshot(SnapshotError::FormatMismatch { .. })
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during storage operations
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// I/O failure carrying the offending path
    #[error("Error occurred at path: {path}")]
    PathError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Serialization failures for persisted data
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// Storage accessed before `open` completed
    #[error("Storage engine is not open")]
    NotOpen,

    /// Error type for value conversion operations
    #[error("Value convert failed")]
    Convert(#[from] ConvertError),
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Operation aborted through the cancel token; target state unchanged
    #[error("Snapshot operation cancelled")]
    Cancelled,

    /// Disk I/O failures on the snapshot sink/source
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Checksum or structural validation failures on recovered bytes
    #[error("Data corruption detected at {location}")]
    Corrupt { location: String },

    /// The source does not carry the expected format tag/version
    #[error("Snapshot format mismatch: {details}")]
    FormatMismatch { details: String },

    /// A save/load is already running on this coordinator
    #[error("Snapshot already in progress")]
    AlreadyInProgress,

    /// Streaming transfer received a chunk out of sequence
    #[error("Out-of-order chunk. Expected {expected}, got {got}")]
    OutOfOrderChunk { expected: u32, got: u32 },

    /// Snapshot creation/restoration failures
    #[error("Snapshot operation failed: {0}")]
    Failed(String),
}

/// Entry application failures.
///
/// Every variant is fatal to the owning state machine instance: the handle
/// latches and refuses further updates rather than risk divergence.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The delivered index broke the strictly increasing, contiguous order
    #[error("Entry applied out of order (expected index {expected}, got {got})")]
    OutOfOrder { expected: u64, got: u64 },

    /// A previous apply failure latched this instance
    #[error("State machine halted after a previous apply failure")]
    Halted,

    /// The instance was closed
    #[error("State machine is closed")]
    Closed,

    /// The entry payload could not be decoded into a command
    #[error("Malformed command at index {index}: {reason}")]
    Malformed { index: u64, reason: String },
}

/// Error type for value conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// Invalid input length error
    ///
    /// This occurs when the input byte slice length doesn't match the
    /// required 8 bytes.
    #[error("invalid byte length: expected 8 bytes, received {0} bytes")]
    InvalidLength(usize),

    /// Generic conversion failure with detailed message
    #[error("conversion failure: {0}")]
    ConversionFailure(String),
}

impl From<ConvertError> for Error {
    fn from(e: ConvertError) -> Self {
        Error::Storage(StorageError::Convert(e))
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        StorageError::DbError(err.to_string()).into()
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(err: sled::transaction::TransactionError<Error>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => StorageError::DbError(e.to_string()).into(),
        }
    }
}
