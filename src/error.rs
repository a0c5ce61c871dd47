use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SelvaError>;

/// Errors surfaced by the storage and index layers.
#[derive(Debug, Error)]
pub enum SelvaError {
    /// Underlying file or device I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A wire or state format could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// On-disk or in-page state is inconsistent.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A named entity was not found.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The store cannot supply more pages.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
}
