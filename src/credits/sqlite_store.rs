use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::LedgerError;
use super::store::{Document, DocumentStore, StoreError, TxUpdate, merge_document};

/// Document store backed by a single SQLite file.
///
/// Transactions open with `BEGIN IMMEDIATE`, which takes the write lock up
/// front: concurrent read-modify-write cycles against the same database, from
/// this process or another, serialize instead of racing on a stale read.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.path.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Document>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            read_document(&conn, &collection, &id)
        })
        .await?
    }

    async fn merge_set(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> Result<Document, StoreError> {
        let path = self.path.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Document, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let mut doc = read_document(&tx, &collection, &id)?.unwrap_or_default();
            merge_document(&mut doc, fields);
            write_document(&tx, &collection, &id, &doc)?;
            tx.commit()?;
            Ok(doc)
        })
        .await?
    }

    async fn transact(
        &self,
        collection: &str,
        id: &str,
        mut update: TxUpdate,
    ) -> Result<Option<Document>, LedgerError> {
        let path = self.path.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        let joined = tokio::task::spawn_blocking(move || -> Result<Option<Document>, LedgerError> {
            let mut conn = open_connection(path).map_err(StoreError::from)?;
            init_schema(&conn).map_err(StoreError::from)?;
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(StoreError::from)?;

            let current = read_document(&tx, &collection, &id)?;
            // Dropping `tx` on the error path rolls back.
            let Some(patch) = update(current.as_ref())? else {
                return Ok(current);
            };

            let mut doc = current.unwrap_or_default();
            merge_document(&mut doc, patch);
            write_document(&tx, &collection, &id, &doc)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(Some(doc))
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(StoreError::from(err).into()),
        }
    }

    async fn append(&self, collection: &str, record: Document) -> Result<String, StoreError> {
        let path = self.path.clone();
        let collection = collection.to_string();
        let value_json = serde_json::to_string(&record)?;
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<String, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO records (collection, value_json, ts_ms) VALUES (?1, ?2, ?3)",
                rusqlite::params![collection, value_json, ts_ms],
            )?;
            Ok(format!("{:020}", conn.last_insert_rowid()))
        })
        .await?
    }

    async fn recent(
        &self,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        let path = self.path.clone();
        let collection = collection.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, Document)>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT seq, value_json
                 FROM records
                 WHERE collection = ?1
                 ORDER BY seq DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![collection, limit], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (seq, raw) = row?;
                out.push((format!("{seq:020}"), serde_json::from_str(&raw)?));
            }
            Ok(out)
        })
        .await?
    }
}

fn read_document(
    conn: &rusqlite::Connection,
    collection: &str,
    id: &str,
) -> Result<Option<Document>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM documents WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn write_document(
    conn: &rusqlite::Connection,
    collection: &str,
    id: &str,
    doc: &Document,
) -> Result<(), StoreError> {
    let value_json = serde_json::to_string(doc)?;
    conn.execute(
        "INSERT INTO documents (collection, id, value_json, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, id) DO UPDATE SET
             value_json = excluded.value_json,
             updated_at_ms = excluded.updated_at_ms",
        rusqlite::params![collection, id, value_json, now_millis()],
    )?;
    Ok(())
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            value_json TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE TABLE IF NOT EXISTS records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            value_json TEXT NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_records_collection_seq
            ON records(collection, seq);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    i64::try_from(crate::utils::now_epoch_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn sqlite_store_merges_and_reads_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("credits.sqlite"));
        store.init().await.expect("init");

        store
            .merge_set("profiles", "u1", doc(json!({"plan": "pulse", "name": "Ada"})))
            .await
            .expect("merge");
        let merged = store
            .merge_set("profiles", "u1", doc(json!({"credits": 12})))
            .await
            .expect("merge");
        assert_eq!(merged["name"], "Ada");

        let loaded = store.get("profiles", "u1").await.expect("get").expect("doc");
        assert_eq!(loaded["credits"], 12);
        assert_eq!(loaded["plan"], "pulse");
        assert!(store.get("profiles", "u2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn sqlite_transact_rolls_back_on_abort() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("credits.sqlite"));
        store
            .merge_set("profiles", "u1", doc(json!({"credits": 3})))
            .await
            .expect("seed");

        let err = store
            .transact(
                "profiles",
                "u1",
                Box::new(|_: Option<&Document>| -> Result<Option<Document>, LedgerError> {
                    Err(LedgerError::InsufficientCredits {
                        required: 10,
                        available: 3,
                    })
                }),
            )
            .await
            .expect_err("abort");
        assert!(matches!(err, LedgerError::InsufficientCredits { .. }));

        let committed = store
            .transact(
                "profiles",
                "u1",
                Box::new(|current: Option<&Document>| -> Result<Option<Document>, LedgerError> {
                    let credits = current
                        .and_then(|doc| doc.get("credits"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    Ok(Some(doc(json!({"credits": credits + 1}))))
                }),
            )
            .await
            .expect("commit")
            .expect("doc");
        assert_eq!(committed["credits"], 4);
    }

    #[tokio::test]
    async fn sqlite_records_list_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("credits.sqlite"));
        for n in 0..3 {
            store
                .append("usage_records", doc(json!({"n": n})))
                .await
                .expect("append");
        }
        store
            .append("other", doc(json!({"n": 99})))
            .await
            .expect("append");

        let recent = store.recent("usage_records", 2).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1["n"], 2);
        assert_eq!(recent[1].1["n"], 1);
    }
}
