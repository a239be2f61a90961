//! Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The backing database could not be opened or created. Whoever asked for
    /// the store should carry on without it.
    #[display("cannot open store: {_0}")]
    StoreOpen(#[error(not(source))] String),
    #[display("database migration error")]
    Migration,
    /// The database was written by an incompatible schema. Never migrated.
    #[display("unsupported format version {} (expected {expected})", found.map_or_else(|| "<missing>".to_string(), |v| v.to_string()))]
    UnsupportedVersion { found: Option<i64>, expected: i64 },
    #[display("database error")]
    Database,
    /// A stored value could not be represented (or vice versa).
    #[display("invalid store data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }
}
