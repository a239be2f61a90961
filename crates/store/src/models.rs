use crate::error::{Error, ErrorKind};
use exn::ResultExt;

#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    id: i64,
    key: String,
    size: i64,
    blob_id: i64,
}

/// Metadata for one cached payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Recency surrogate. Larger is more recently used.
    pub id: i64,
    pub key: String,
    /// Payload length in bytes.
    pub size: u64,
    pub blob_id: i64,
}
impl TryFrom<EntryRow> for Entry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            key: row.key,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("entry size"))?,
            blob_id: row.blob_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_model() {
        let row = EntryRow { id: 7, key: "pkg:screenshot:vim".to_string(), size: 1024, blob_id: 3 };
        let entry = Entry::try_from(row).unwrap();
        assert_eq!(entry.size, 1024);
        assert_eq!(entry.key, "pkg:screenshot:vim");
    }

    #[test]
    fn test_negative_size_is_invalid() {
        let row = EntryRow { id: 7, key: "broken".to_string(), size: -1, blob_id: 3 };
        let err = Entry::try_from(row).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("entry size"));
    }
}
