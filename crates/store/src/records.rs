//! Record operations on the cache schema.
//!
//! Every function takes a bare connection so it can run inside a transaction
//! (`&mut *tx`). None of them start or finish transactions themselves.

use exn::{OptionExt, ResultExt};
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::SqliteConnection;

use crate::error::{ErrorKind, Result};
use crate::models::{Entry, EntryRow};

fn to_sql_size(size: u64) -> Result<i64> {
    i64::try_from(size).or_raise(|| ErrorKind::InvalidData("size"))
}

fn from_sql_size(size: i64) -> Result<u64> {
    u64::try_from(size).or_raise(|| ErrorKind::InvalidData("size"))
}

// =========================================================================
// Format & Globals
// =========================================================================

/// The schema version stamped into the store, if any.
pub async fn format_version(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    sqlx::query_scalar::<_, i64>(include_str!("../queries/format_version.sql"))
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

/// The total size of all entries, as recorded in the globals row.
pub async fn total_size(conn: &mut SqliteConnection) -> Result<u64> {
    let size = sqlx::query_scalar::<_, i64>(include_str!("../queries/total_size.sql"))
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?
        .ok_or_raise(|| ErrorKind::InvalidData("missing total size"))?;
    from_sql_size(size)
}

/// The total size of all entries, summed from the entries themselves.
pub async fn computed_total_size(conn: &mut SqliteConnection) -> Result<u64> {
    let size = sqlx::query_scalar::<_, i64>(include_str!("../queries/computed_total_size.sql"))
        .fetch_one(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    from_sql_size(size)
}

/// Overwrite the recorded total size.
pub async fn set_total_size(conn: &mut SqliteConnection, size: u64) -> Result<()> {
    sqlx::query(include_str!("../queries/set_total_size.sql"))
        .bind(to_sql_size(size)?)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Whether a table named `name` exists in the database.
pub async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    sqlx::query_scalar::<_, bool>(include_str!("../queries/table_exists.sql"))
        .bind(name)
        .fetch_one(conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

// =========================================================================
// Entries
// =========================================================================

pub async fn entry_count(conn: &mut SqliteConnection) -> Result<u64> {
    let count = sqlx::query_scalar::<_, i64>(include_str!("../queries/entry_count.sql"))
        .fetch_one(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    u64::try_from(count).or_raise(|| ErrorKind::InvalidData("entry count"))
}

pub async fn find_entry(conn: &mut SqliteConnection, key: &str) -> Result<Option<Entry>> {
    let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/find_entry.sql"))
        .bind(key)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(Entry::try_from).transpose()
}

/// All entries, least recently used first.
///
/// The stream borrows the connection; drop it before issuing other queries.
pub fn eviction_candidates(conn: &mut SqliteConnection) -> BoxStream<'_, Result<Entry>> {
    sqlx::query_as::<_, EntryRow>(include_str!("../queries/eviction_candidates.sql"))
        .fetch(conn)
        .map(|row| row.or_raise(|| ErrorKind::Database).and_then(Entry::try_from))
        .boxed()
}

/// Delete every entry with an id up to and including `id`, along with any
/// blobs left unreferenced. Returns the number of entries deleted.
pub async fn delete_entries_through(conn: &mut SqliteConnection, id: i64) -> Result<u64> {
    let result = sqlx::query(include_str!("../queries/delete_entries_through.sql"))
        .bind(id)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected())
}

/// Delete the entry for `key`, if there is one. Its blob goes with it.
pub async fn delete_entry_by_key(conn: &mut SqliteConnection, key: &str) -> Result<bool> {
    let result = sqlx::query(include_str!("../queries/delete_entry_by_key.sql"))
        .bind(key)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected() > 0)
}

/// Insert an entry referencing an existing blob, returning its id.
///
/// Fails if `key` is already present or `blob_id` does not exist.
pub async fn insert_entry(conn: &mut SqliteConnection, key: &str, size: u64, blob_id: i64) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(include_str!("../queries/insert_entry.sql"))
        .bind(key)
        .bind(to_sql_size(size)?)
        .bind(blob_id)
        .fetch_one(conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

/// Move an entry to the most recently used position, returning its new id.
///
/// Ids are never reused, so this would only fail after `i64::MAX` promotions.
pub async fn promote(conn: &mut SqliteConnection, id: i64) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(include_str!("../queries/promote.sql"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?
        .ok_or_raise(|| ErrorKind::InvalidData("promoted entry vanished"))
}

// =========================================================================
// Blobs
// =========================================================================

/// Insert an empty blob of the given declared size, returning its id.
pub async fn insert_blob(conn: &mut SqliteConnection, size: u64) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(include_str!("../queries/insert_blob.sql"))
        .bind(to_sql_size(size)?)
        .fetch_one(conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

/// Append the chunk numbered `seq` to a blob.
pub async fn append_chunk(conn: &mut SqliteConnection, blob_id: i64, seq: i64, data: &[u8]) -> Result<()> {
    sqlx::query(include_str!("../queries/append_chunk.sql"))
        .bind(blob_id)
        .bind(seq)
        .bind(data)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// A blob's chunks, in order.
///
/// The stream borrows the connection; drop it before issuing other queries.
pub fn blob_chunks(conn: &mut SqliteConnection, blob_id: i64) -> BoxStream<'_, Result<Vec<u8>>> {
    sqlx::query_scalar::<_, Vec<u8>>(include_str!("../queries/blob_chunks.sql"))
        .bind(blob_id)
        .fetch(conn)
        .map(|chunk| chunk.or_raise(|| ErrorKind::Database))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Location, Store};
    use futures::TryStreamExt;

    async fn insert(conn: &mut SqliteConnection, key: &str, data: &[u8]) -> i64 {
        let blob = insert_blob(conn, data.len() as u64).await.unwrap();
        append_chunk(conn, blob, 0, data).await.unwrap();
        insert_entry(conn, key, data.len() as u64, blob).await.unwrap()
    }

    async fn blob_count(conn: &mut SqliteConnection) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM blobs").fetch_one(conn).await.unwrap()
    }

    async fn chunk_count(conn: &mut SqliteConnection) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM blob_chunks").fetch_one(conn).await.unwrap()
    }

    #[tokio::test]
    async fn test_triggers_track_total_size() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        insert(&mut tx, "a", b"hello").await;
        insert(&mut tx, "b", b"world!").await;
        assert_eq!(total_size(&mut tx).await.unwrap(), 11);
        assert!(delete_entry_by_key(&mut tx, "a").await.unwrap());
        assert_eq!(total_size(&mut tx).await.unwrap(), 6);
        assert_eq!(computed_total_size(&mut tx).await.unwrap(), 6);
        assert!(!delete_entry_by_key(&mut tx, "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_deleting_entry_deletes_blob_and_chunks() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        insert(&mut tx, "a", b"hello").await;
        assert_eq!(blob_count(&mut tx).await, 1);
        assert_eq!(chunk_count(&mut tx).await, 1);
        delete_entry_by_key(&mut tx, "a").await.unwrap();
        assert_eq!(blob_count(&mut tx).await, 0);
        assert_eq!(chunk_count(&mut tx).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        insert(&mut tx, "a", b"hello").await;
        let blob = insert_blob(&mut tx, 1).await.unwrap();
        assert!(insert_entry(&mut tx, "a", 1, blob).await.is_err());
    }

    #[tokio::test]
    async fn test_eviction_candidates_are_oldest_first() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let first = insert(&mut tx, "first", b"1").await;
        insert(&mut tx, "second", b"22").await;
        insert(&mut tx, "third", b"333").await;
        promote(&mut tx, first).await.unwrap();
        let keys: Vec<String> = eviction_candidates(&mut tx).map_ok(|e| e.key).try_collect().await.unwrap();
        assert_eq!(keys, vec!["second", "third", "first"]);
    }

    #[tokio::test]
    async fn test_promote_moves_past_maximum() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let first = insert(&mut tx, "first", b"1").await;
        let second = insert(&mut tx, "second", b"2").await;
        let promoted = promote(&mut tx, first).await.unwrap();
        assert!(promoted > second);
        assert_eq!(find_entry(&mut tx, "first").await.unwrap().unwrap().id, promoted);
        // Promotion doesn't change sizes.
        assert_eq!(total_size(&mut tx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_entries_through() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        insert(&mut tx, "a", b"1").await;
        let b = insert(&mut tx, "b", b"22").await;
        insert(&mut tx, "c", b"333").await;
        assert_eq!(delete_entries_through(&mut tx, b).await.unwrap(), 2);
        assert_eq!(entry_count(&mut tx).await.unwrap(), 1);
        assert_eq!(total_size(&mut tx).await.unwrap(), 3);
        assert_eq!(blob_count(&mut tx).await, 1);
    }

    #[tokio::test]
    async fn test_blob_chunks_are_ordered() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let blob = insert_blob(&mut tx, 6).await.unwrap();
        // Written out of order on purpose.
        append_chunk(&mut tx, blob, 2, b"ef").await.unwrap();
        append_chunk(&mut tx, blob, 0, b"ab").await.unwrap();
        append_chunk(&mut tx, blob, 1, b"cd").await.unwrap();
        let chunks: Vec<Vec<u8>> = blob_chunks(&mut tx, blob).try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"abcdef");
    }

    #[tokio::test]
    async fn test_table_exists() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        assert!(table_exists(&mut tx, "entries").await.unwrap());
        assert!(!table_exists(&mut tx, "screenshots").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_missing_entry() {
        let mut store = Store::open(Location::Memory).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(find_entry(&mut tx, "nope").await.unwrap(), None);
    }
}
