//! Transfer error model
//!
//! `TransferError` is the single error sum for the engine. Each variant maps
//! onto one transport `ErrorKind`, which is what callers and event sinks
//! classify on. Overwrite refusals and path-validation failures are control
//! flow: callers turn them into `Skipped`, they never fail a directory run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Transport codes surfaced in event payloads and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotOverwriteExistingDestination,
    PathCustomValidationFailed,
    FailedCheckingShouldTransfer,
    FailToEnumerateDirectory,
    FailToValidateDestination,
    TransferStuck,
    TransferAlreadyExists,
    SourceAndDestinationLocationEqual,
    SourceAndDestinationBlobTypeDifferent,
    OutOfMemory,
    UncategorizedException,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotOverwriteExistingDestination => "NotOverwriteExistingDestination",
            ErrorKind::PathCustomValidationFailed => "PathCustomValidationFailed",
            ErrorKind::FailedCheckingShouldTransfer => "FailedCheckingShouldTransfer",
            ErrorKind::FailToEnumerateDirectory => "FailToEnumerateDirectory",
            ErrorKind::FailToValidateDestination => "FailToValidateDestination",
            ErrorKind::TransferStuck => "TransferStuck",
            ErrorKind::TransferAlreadyExists => "TransferAlreadyExists",
            ErrorKind::SourceAndDestinationLocationEqual => "SourceAndDestinationLocationEqual",
            ErrorKind::SourceAndDestinationBlobTypeDifferent => {
                "SourceAndDestinationBlobTypeDifferent"
            }
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::UncategorizedException => "UncategorizedException",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("destination {0} exists and overwrite was refused")]
    NotOverwriteExistingDestination(String),

    #[error("path validation rejected {path}: {reason}")]
    PathCustomValidationFailed { path: String, reason: String },

    #[error("should-transfer check failed for {0}: {1}")]
    FailedCheckingShouldTransfer(String, String),

    #[error("failed to enumerate {path}")]
    FailToEnumerateDirectory {
        path: String,
        #[source]
        source: Box<TransferError>,
    },

    #[error("failed to validate destination {0}: {1}")]
    FailToValidateDestination(String, String),

    #[error("no copy progress observed within {0:?}")]
    TransferStuck(Duration),

    #[error("a transfer from {src} to {dest} is already running")]
    TransferAlreadyExists { src: String, dest: String },

    #[error("source and destination refer to the same location: {0}")]
    SourceAndDestinationLocationEqual(String),

    #[error("source blob type {src:?} differs from destination blob type {dest:?}")]
    SourceAndDestinationBlobTypeDifferent {
        src: crate::location::BlobType,
        dest: crate::location::BlobType,
    },

    #[error("memory reservation of {requested} cells exceeds the pool ceiling of {capacity}")]
    OutOfMemory { requested: usize, capacity: usize },

    #[error("relative path exceeds {limit} characters: {path}")]
    RelativePathTooLong { path: String, limit: usize },

    #[error("journal format version {found:?} is not compatible with {expected:?}")]
    JournalVersionMismatch { found: String, expected: String },

    #[error("malformed journal: {0}")]
    JournalCorrupt(String),

    #[error("stream locations cannot be serialized for resume")]
    StreamNotResumable,

    #[error("blob {0} exceeds the protocol size limit")]
    BlobTooLarge(String),

    #[error("storage request failed: {0}")]
    Storage(String),

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Uncategorized(String),
}

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::NotOverwriteExistingDestination(_) => {
                ErrorKind::NotOverwriteExistingDestination
            }
            TransferError::PathCustomValidationFailed { .. } => {
                ErrorKind::PathCustomValidationFailed
            }
            TransferError::FailedCheckingShouldTransfer(..) => {
                ErrorKind::FailedCheckingShouldTransfer
            }
            TransferError::FailToEnumerateDirectory { .. } => ErrorKind::FailToEnumerateDirectory,
            TransferError::FailToValidateDestination(..) => ErrorKind::FailToValidateDestination,
            TransferError::TransferStuck(_) => ErrorKind::TransferStuck,
            TransferError::TransferAlreadyExists { .. } => ErrorKind::TransferAlreadyExists,
            TransferError::SourceAndDestinationLocationEqual(_) => {
                ErrorKind::SourceAndDestinationLocationEqual
            }
            TransferError::SourceAndDestinationBlobTypeDifferent { .. } => {
                ErrorKind::SourceAndDestinationBlobTypeDifferent
            }
            TransferError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            _ => ErrorKind::UncategorizedException,
        }
    }

    /// Errors the caller reclassifies into `Skipped` rather than `Failed`.
    pub fn is_skip(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotOverwriteExistingDestination | ErrorKind::PathCustomValidationFailed
        )
    }

    /// Errors that cancel sibling work inside a directory transfer.
    pub fn is_fatal_to_siblings(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransferStuck | ErrorKind::FailedCheckingShouldTransfer
        )
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
