use thiserror::Error;

/// Every error kind the storage layer can surface, per the propagation
/// policy: per-chunk errors fail only that chunk, per-file errors fail only
/// in-flight operations against that file, per-process errors fail
/// everything pending for a region.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("chunk ({cx}, {cz}) failed integrity check: {reason}")]
    Corrupted { cx: i32, cz: i32, reason: String },

    #[error("operation attempted on a closed region or manager")]
    Closed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors raised by [`crate::codec::Codec`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("compression algorithm {0:?} is not supported")]
    Unsupported(crate::codec::Algorithm),

    #[error("malformed compressed frame: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
