#![forbid(unsafe_code)]
//! Error types for the loam storage engine.
//!
//! Defines `LoamError` and a `Result<T>` alias used throughout the
//! workspace.

use thiserror::Error;

/// Unified error type for all loam operations.
#[derive(Debug, Error)]
pub enum LoamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left on device")]
    NoSpace,

    #[error("every cache slot is pinned")]
    CacheFull,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt tree at block {block}: {detail}")]
    CorruptTree { block: u64, detail: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LoamError {
    /// Whether the error leaves the engine in a usable state.
    ///
    /// `CorruptTree` is fatal: the on-disk structure violated an
    /// invariant and must not be silently overwritten.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CorruptTree { .. })
    }
}

/// Result alias using `LoamError`.
pub type Result<T> = std::result::Result<T, LoamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_tree_is_fatal() {
        let err = LoamError::CorruptTree {
            block: 7,
            detail: "keys out of order".to_owned(),
        };
        assert!(!err.is_recoverable());
        assert!(LoamError::NoSpace.is_recoverable());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing image");
        let err = LoamError::from(io);
        assert!(matches!(err, LoamError::Io(_)));
    }
}
