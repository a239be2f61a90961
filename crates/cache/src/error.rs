//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! None of these ever reach users of [`Cache`](crate::Cache): a tier logs them
//! and reports a miss (or does nothing) instead. They exist so the failure
//! paths inside a tier can be told apart, tested and logged.

use derive_more::{Display, Error};
use stash_store::error::{Error as StoreError, ErrorKind as StoreErrorKind};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error from the underlying store (opening it, or running a query).
    #[display("store error: {_0}")]
    Store(StoreErrorKind),
    /// The store's contents contradict themselves. The operation was aborted
    /// and rolled back.
    #[display("cache corruption: {_0}")]
    Corruption(#[error(not(source))] &'static str),
    /// The file to be cached couldn't be opened or inspected.
    #[display("source unavailable: {}", _0.display())]
    SourceUnavailable(#[error(not(source))] PathBuf),
    /// The file to be cached ended (or failed) before its reported size was read.
    #[display("truncated input: {}", _0.display())]
    TruncatedInput(#[error(not(source))] PathBuf),
    #[display("failed to write payload to the store")]
    StoreWrite,
    /// The payload couldn't be written out to a temporary file.
    #[display("failed to extract payload")]
    Extract,
    /// The tier was closed by its owner.
    #[display("tier is closed")]
    Closed,
}
impl From<StoreErrorKind> for ErrorKind {
    fn from(kind: StoreErrorKind) -> Self {
        Self::Store(kind)
    }
}
impl ErrorKind {
    /// Convert a store error into a cache error, preserving the store
    /// crate's `Exn` frame (error tree) as a child in its own error tree.
    #[track_caller]
    pub fn store(err: StoreError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Store(inner))
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(kind) => kind.is_retryable(),
            Self::SourceUnavailable(_) | Self::TruncatedInput(_) | Self::Extract => true,
            Self::Corruption(_) | Self::StoreWrite | Self::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::Corruption("dangling total").to_string(), "cache corruption: dangling total");
        assert_eq!(
            ErrorKind::SourceUnavailable(PathBuf::from("/tmp/missing.deb")).to_string(),
            "source unavailable: /tmp/missing.deb"
        );
        assert_eq!(ErrorKind::Store(StoreErrorKind::Database).to_string(), "store error: database error");
    }

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::Store(StoreErrorKind::Database).is_retryable());
        assert!(!ErrorKind::Store(StoreErrorKind::Migration).is_retryable());
        assert!(!ErrorKind::Corruption("").is_retryable());
        assert!(ErrorKind::TruncatedInput(PathBuf::from("x")).is_retryable());
    }

    #[test]
    fn store_errors_keep_their_kind() {
        let err: StoreError = exn::Exn::from(StoreErrorKind::Migration);
        let err = ErrorKind::store(err);
        assert_eq!(*err, ErrorKind::Store(StoreErrorKind::Migration));
    }
}
