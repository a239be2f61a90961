//! Database connection, schema checks and transactions.

use exn::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, Sqlite, SqliteConnection, Transaction};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::records;

/// Schema version stamped into every freshly created store.
///
/// Must match the version inserted by `migrations/0001_cache_schema.sql`.
pub const FORMAT_VERSION: i64 = 1;

/// Table sqlx records applied migrations in.
const MIGRATIONS_TABLE: &str = "_sqlx_migrations";

/// Where a store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Ephemeral database, destroyed when the store is closed or dropped.
    Memory,
    /// Durable database file, created if it doesn't exist.
    File(PathBuf),
}
impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str(":memory:"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}
impl From<PathBuf> for Location {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}
impl From<&Path> for Location {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

/// A single transactional connection to a cache database.
///
/// The connection is not safe to share between concurrent operations; the
/// owner is expected to serialize access to it (see `stash_cache::Tier`).
#[derive(Debug)]
pub struct Store {
    conn: SqliteConnection,
    location: Location,
}

impl Store {
    /// Open (or create) the store at `location`.
    ///
    /// Fresh databases get the current schema. Existing databases must carry
    /// [`FORMAT_VERSION`]; anything else is refused with
    /// [`ErrorKind::UnsupportedVersion`] rather than reinterpreted.
    #[instrument(level = "debug", skip(location), fields(location = %location))]
    pub async fn open(location: Location) -> Result<Self> {
        let options = match &location {
            Location::Memory => Self::base_options().filename(":memory:"),
            Location::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).or_raise(|| ErrorKind::StoreOpen(location.to_string()))?;
                }
                Self::base_options()
                    .filename(path)
                    .create_if_missing(true)
                    // WAL is meaningless for in-memory databases.
                    .journal_mode(SqliteJournalMode::Wal)
            },
        };
        let mut conn = options.connect().await.or_raise(|| ErrorKind::StoreOpen(location.to_string()))?;
        Self::apply_pragmas(&mut conn).await.or_raise(|| ErrorKind::StoreOpen(location.to_string()))?;
        let mut store = Self { conn, location };
        store.migrate().await?;
        store.sanity_check().await?;
        Ok(store)
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // Referential integrity between entries, blobs and chunks relies on this.
            .foreign_keys(true)
            // PRAGMA synchronous = NORMAL (balance between safety and speed)
            .synchronous(SqliteSynchronous::Normal)
            // Another process may hold the on-disk cache open.
            .busy_timeout(std::time::Duration::from_millis(1500))
            // Freed blob pages get reused by the next put anyway.
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("performing database migrations", level = "debug", skip(self))]
    async fn migrate(&mut self) -> Result<()> {
        // A cache schema without a migration ledger wasn't created by us. Leave
        // it alone and let the format check decide whether it's usable.
        if records::table_exists(&mut self.conn, "format").await?
            && !records::table_exists(&mut self.conn, MIGRATIONS_TABLE).await?
        {
            tracing::debug!(location = %self.location, "Existing schema has no migration history; skipping migrations");
            return Ok(());
        }
        let mut migrator = sqlx::migrate!("./migrations");
        // A database created by a newer build has migrations we don't know
        // about. Let the format check report that instead.
        migrator.set_ignore_missing(true);
        migrator.run(&mut self.conn).await.or_raise(|| ErrorKind::Migration)
    }

    /// Verify the format version and repair the stored total size.
    async fn sanity_check(&mut self) -> Result<()> {
        let location = self.location.to_string();
        let mut tx = self.begin().await?;
        let outcome = Self::check_and_repair(&mut tx, &location).await;
        settle(tx, outcome).await
    }

    async fn check_and_repair(conn: &mut SqliteConnection, location: &str) -> Result<()> {
        let found = records::format_version(conn).await?;
        if found != Some(FORMAT_VERSION) {
            exn::bail!(ErrorKind::UnsupportedVersion { found, expected: FORMAT_VERSION });
        }
        let stored = records::total_size(conn).await?;
        let computed = records::computed_total_size(conn).await?;
        if stored != computed {
            tracing::warn!(
                location,
                stored,
                computed,
                "Inconsistent cache state: stored total size does not match the actual total size; fixing it"
            );
            records::set_total_size(conn, computed).await?;
        }
        Ok(())
    }

    /// Where this store keeps its data.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Start a transaction.
    ///
    /// The returned guard rolls back when dropped unless it was committed,
    /// so early returns and cancelled futures never leave partial writes
    /// behind. Prefer finishing it with [`settle`].
    pub async fn begin(&mut self) -> Result<Transaction<'_, Sqlite>> {
        self.conn.begin().await.or_raise(|| ErrorKind::Database)
    }

    /// Close the connection.
    ///
    /// In-memory stores lose all of their contents.
    pub async fn close(mut self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&mut self.conn).await;
        if let Err(err) = self.conn.close().await {
            tracing::debug!(location = %self.location, error = %err, "Error closing store connection");
        }
    }
}

/// Finish a transaction according to the outcome of the work done inside it.
///
/// `Ok` commits. `Err` rolls back and returns the original error untouched;
/// a failed rollback is only logged.
///
/// Generic over the error kind so that crates layering their own errors on
/// top of the store's can settle their transactions too.
pub async fn settle<T, K>(
    tx: Transaction<'_, Sqlite>,
    outcome: std::result::Result<T, exn::Exn<K>>,
) -> std::result::Result<T, exn::Exn<K>>
where
    K: From<ErrorKind> + std::error::Error + Send + Sync + 'static,
{
    match outcome {
        Ok(value) => {
            tx.commit().await.or_raise(|| K::from(ErrorKind::Database))?;
            Ok(value)
        },
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                let kind: &K = &err;
                tracing::warn!(error = %rollback, original = %kind, "Rollback failed");
            }
            Err(err)
        },
    }
}
