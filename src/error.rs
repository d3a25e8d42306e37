//! Errors produced while generating, validating, storing, or lowering a CFG.

use std::path::PathBuf;
use thiserror::Error;

/// Shorthand for results carrying an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A generator or lowering parameter is out of range.
    ///
    /// Raised before any part of the IR is touched.
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// Some entity in the IR violates an invariant of the CFG model
    /// (e.g. a branch with the wrong number of targets).
    #[error("malformed CFG: {message}")]
    Structural { message: String },

    /// An [`IdAllocator`](crate::IdAllocator) ran out of identifiers.
    #[error("identifier space exhausted")]
    AllocationExhausted,

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON interchange error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary interchange error: {0}")]
    Binary(#[from] bincode::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural { message: message.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
