//! Transactional SQLite storage for the stash blob cache.
//!
//! A [`Store`] is one SQLite database (in memory or on disk) holding the
//! cache schema: a format version, a running total of payload sizes, and
//! entries whose payloads live in separate, chunked blobs. It knows nothing
//! about budgets or eviction, that's the job of `stash-cache`.
//!
//! # Invariants
//! Maintained by the schema itself (triggers and foreign keys), not by callers:
//! - The recorded total size equals the sum of all entry sizes. It's also
//!   re-derived, and repaired if necessary, every time a store is opened.
//! - A blob exists if and only if an entry references it.

pub mod error;
mod models;
pub mod records;
mod store;

pub use crate::models::Entry;
pub use crate::store::{FORMAT_VERSION, Location, Store, settle};
pub use sqlx::{Sqlite, SqliteConnection, Transaction};
