//! Persistent index of records already extracted.
//!
//! Keys are `(source_account, record_id)`. The SQLite table is the durable
//! copy; an in-memory set mirrors it so lookups never touch the database.

use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::error::{ErrorCode, FerryError, FerryResult};

type Key = (String, String);

/// SQLite-backed dedup index.
pub struct DedupIndex {
    conn: Mutex<Connection>,
    seen: RwLock<HashSet<Key>>,
}

impl DedupIndex {
    /// Open (or create) the index at `db_path` and load existing keys.
    pub fn open(db_path: impl AsRef<Path>) -> FerryResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| FerryError::Database {
            message: format!("cannot open dedup index {}: {}", db_path.display(), e),
            code: ErrorCode::DbConnectionFailed,
            source: Some(Box::new(e)),
        })?;
        Self::from_connection(conn)
    }

    /// Index that lives only for the lifetime of the process.
    pub fn in_memory() -> FerryResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> FerryResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS seen_records (
                source_account TEXT NOT NULL,
                record_id      TEXT NOT NULL,
                first_seen_at  TEXT NOT NULL,
                PRIMARY KEY (source_account, record_id)
            );
            "#,
        )?;

        let mut seen: HashSet<Key> = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT source_account, record_id FROM seen_records")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                seen.insert(row?);
            }
        }
        tracing::debug!(keys = seen.len(), "dedup index loaded");

        Ok(Self {
            conn: Mutex::new(conn),
            seen: RwLock::new(seen),
        })
    }

    /// Whether `(account, record_id)` was extracted before.
    pub fn seen(&self, account: &str, record_id: &str) -> FerryResult<bool> {
        let seen = self.seen.read().map_err(|_| poisoned())?;
        Ok(seen.contains(&(account.to_string(), record_id.to_string())))
    }

    /// Record a key. Returns `true` if it was not known before.
    ///
    /// Call only after the record has been durably written.
    pub fn mark_seen(&self, account: &str, record_id: &str) -> FerryResult<bool> {
        Ok(self.mark_seen_batch(account, [record_id])? == 1)
    }

    /// Record several keys of one account in a single transaction.
    /// Returns how many were new.
    pub fn mark_seen_batch<'a>(
        &self,
        account: &str,
        record_ids: impl IntoIterator<Item = &'a str>,
    ) -> FerryResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().map_err(|_| poisoned())?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO seen_records (source_account, record_id, first_seen_at) VALUES (?1, ?2, ?3)",
            )?;
            for id in record_ids {
                if stmt.execute(params![account, id, now])? == 1 {
                    inserted.push(id.to_string());
                }
            }
        }
        tx.commit()?;

        let count = inserted.len();
        let mut seen = self.seen.write().map_err(|_| poisoned())?;
        seen.extend(inserted.into_iter().map(|id| (account.to_string(), id)));
        Ok(count)
    }

    /// Total number of keys.
    pub fn len(&self) -> usize {
        self.seen.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys recorded for one account.
    pub fn count_for(&self, account: &str) -> usize {
        self.seen
            .read()
            .map(|s| s.iter().filter(|(a, _)| a == account).count())
            .unwrap_or(0)
    }
}

fn poisoned() -> FerryError {
    FerryError::Database {
        message: "dedup index lock poisoned".to_string(),
        code: ErrorCode::DbOperationFailed,
        source: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_then_seen() {
        let index = DedupIndex::in_memory().unwrap();
        assert!(!index.seen("support", "wamid.1").unwrap());
        assert!(index.mark_seen("support", "wamid.1").unwrap());
        assert!(index.seen("support", "wamid.1").unwrap());
        assert!(!index.mark_seen("support", "wamid.1").unwrap());
    }

    #[test]
    fn test_keys_are_scoped_by_account() {
        let index = DedupIndex::in_memory().unwrap();
        index.mark_seen("a", "1").unwrap();
        assert!(!index.seen("b", "1").unwrap());
        assert_eq!(index.count_for("a"), 1);
        assert_eq!(index.count_for("b"), 0);
    }

    #[test]
    fn test_batch_counts_only_new_keys() {
        let index = DedupIndex::in_memory().unwrap();
        index.mark_seen("a", "1").unwrap();
        let new = index.mark_seen_batch("a", ["1", "2", "3"]).unwrap();
        assert_eq!(new, 2);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("dedup.db");
        {
            let index = DedupIndex::open(&path).unwrap();
            index.mark_seen_batch("inbox", ["<m1@x>", "<m2@x>"]).unwrap();
        }
        let index = DedupIndex::open(&path).unwrap();
        assert!(index.seen("inbox", "<m1@x>").unwrap());
        assert_eq!(index.count_for("inbox"), 2);
    }
}
