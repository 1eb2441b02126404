//! SQLite-backed `DocumentStore`.
//!
//! Documents live as JSON text in one table keyed by collection. Filters are
//! evaluated in Rust with the same matcher the in-memory store uses, and
//! updates run inside an immediate transaction so the revision check and the
//! write cannot interleave with another writer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::Value;
use timbre_core::{
    store::document::{apply_patch, check_revision, matches_filter, not_found, prepare_insert},
    DocumentStore, Result, TimbreError,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    db_path: PathBuf,
}

impl SqliteDocumentStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS documents (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              collection TEXT NOT NULL,
              body TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, id);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.open()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

/// First `(id, doc)` in `collection` matching `filter`, in insertion order.
fn find_row(conn: &Connection, collection: &str, filter: &Value) -> Result<Option<(i64, Value)>> {
    let mut stmt = conn
        .prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")
        .map_err(db_err)?;
    let mut rows = stmt.query(params![collection]).map_err(db_err)?;
    while let Some(row) = rows.next().map_err(db_err)? {
        let body: String = row.get(1).map_err(db_err)?;
        let doc: Value = serde_json::from_str(&body)
            .map_err(|e| TimbreError::Other(anyhow::anyhow!("corrupt {collection} document: {e}")))?;
        if matches_filter(&doc, filter) {
            return Ok(Some((row.get(0).map_err(db_err)?, doc)));
        }
    }
    Ok(None)
}

impl DocumentStore for SqliteDocumentStore {
    fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>> {
        let conn = self.open()?;
        Ok(find_row(&conn, collection, filter)?.map(|(_, doc)| doc))
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        patch: &Value,
        expected_revision: Option<u64>,
    ) -> Result<u64> {
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let (id, mut doc) =
            find_row(&tx, collection, filter)?.ok_or_else(|| not_found(collection, filter))?;
        check_revision(collection, &doc, expected_revision)?;
        let revision = apply_patch(&mut doc, patch)?;
        tx.execute(
            "UPDATE documents SET body = ?1, updated_at = ?2 WHERE id = ?3",
            params![doc.to_string(), Utc::now().timestamp(), id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(revision)
    }

    fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        let doc = prepare_insert(doc)?;
        let now = Utc::now().timestamp();
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO documents (collection, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![collection, doc.to_string(), now],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> TimbreError {
    TimbreError::Other(anyhow::Error::new(e).context("sqlite document store"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use timbre_core::store::document::by;

    fn store() -> (tempfile::TempDir, SqliteDocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::new(dir.path().join("db").join("timbre.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_find_update() {
        let (_dir, s) = store();
        s.insert_one("models", json!({"id": "m1", "name": "alto"})).unwrap();
        s.insert_one("models", json!({"id": "m2"})).unwrap();
        assert_eq!(s.count("models").unwrap(), 2);

        let doc = s.find_one("models", &by("id", "m1")).unwrap().unwrap();
        assert_eq!(doc["revision"], 1);
        assert_eq!(doc["name"], "alto");

        let rev = s
            .update_one("models", &by("id", "m1"), &json!({"snr": 3.5}), Some(1))
            .unwrap();
        assert_eq!(rev, 2);
        let doc = s.find_one("models", &by("id", "m1")).unwrap().unwrap();
        assert_eq!(doc["snr"], 3.5);
        assert_eq!(doc["name"], "alto");
        assert!(s.find_one("jobs", &by("id", "m2")).unwrap().is_none());
    }

    #[test]
    fn stale_revision_and_missing_documents() {
        let (_dir, s) = store();
        s.insert_one("models", json!({"id": "m1"})).unwrap();
        s.update_one("models", &by("id", "m1"), &json!({"a": 1}), None)
            .unwrap();
        assert!(matches!(
            s.update_one("models", &by("id", "m1"), &json!({"a": 2}), Some(1)),
            Err(TimbreError::RevisionConflict {
                expected: 1,
                found: 2,
                ..
            })
        ));
        assert!(matches!(
            s.update_one("models", &by("id", "nope"), &json!({"a": 2}), None),
            Err(TimbreError::NotFound { .. })
        ));
        assert!(s.insert_one("models", json!([1, 2])).is_err());
    }

    #[test]
    fn concurrent_writers_keep_every_increment() {
        let (_dir, s) = store();
        let s = Arc::new(s);
        s.insert_one("counters", json!({"id": "c", "n": 0})).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        loop {
                            let doc = s.find_one("counters", &by("id", "c")).unwrap().unwrap();
                            let n = doc["n"].as_u64().unwrap();
                            let rev = doc["revision"].as_u64();
                            match s.update_one("counters", &by("id", "c"), &json!({"n": n + 1}), rev) {
                                Ok(_) => break,
                                Err(TimbreError::RevisionConflict { .. }) => continue,
                                Err(e) => panic!("{e}"),
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let doc = s.find_one("counters", &by("id", "c")).unwrap().unwrap();
        assert_eq!(doc["n"], 40);
        assert_eq!(doc["revision"], 41);
    }
}
