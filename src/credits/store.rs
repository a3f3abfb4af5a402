use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::LedgerError;

pub type Document = serde_json::Map<String, Value>;

/// Read-check-write step run inside [`DocumentStore::transact`].
///
/// Receives the committed document (if any). `Ok(Some(patch))` merges the patch
/// and commits, `Ok(None)` commits nothing, `Err` aborts and leaves the document
/// untouched. Implementations that retry on conflict may call it more than once.
pub type TxUpdate =
    Box<dyn FnMut(Option<&Document>) -> Result<Option<Document>, LedgerError> + Send>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Partial update: fields in `fields` overwrite, everything else is kept.
    /// Returns the merged document.
    async fn merge_set(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> Result<Document, StoreError>;

    /// Atomic read-modify-write of one document relative to every other
    /// `transact` on the same document. Returns the document as committed.
    async fn transact(
        &self,
        collection: &str,
        id: &str,
        update: TxUpdate,
    ) -> Result<Option<Document>, LedgerError>;

    /// Appends a record to an append-only collection and returns its id.
    async fn append(&self, collection: &str, record: Document) -> Result<String, StoreError>;

    /// Newest-first slice of an append-only collection.
    async fn recent(
        &self,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StoreError>;
}

/// Merges `patch` into `target`. Nested objects merge key by key; every other
/// value replaces what was there.
pub fn merge_document(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_document(existing, nested);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<String, BTreeMap<String, Document>>,
    records: HashMap<String, Vec<(String, Document)>>,
    seq: u64,
}

/// Process-local store. A single lock guards all collections, so `transact`
/// calls are fully serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn merge_set(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
    ) -> Result<Document, StoreError> {
        let mut state = self.lock()?;
        let doc = state
            .documents
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        merge_document(doc, fields);
        Ok(doc.clone())
    }

    async fn transact(
        &self,
        collection: &str,
        id: &str,
        mut update: TxUpdate,
    ) -> Result<Option<Document>, LedgerError> {
        let mut state = self.lock()?;
        let docs = state.documents.entry(collection.to_string()).or_default();
        let current = docs.get(id);
        let Some(patch) = update(current)? else {
            return Ok(current.cloned());
        };
        let doc = docs.entry(id.to_string()).or_default();
        merge_document(doc, patch);
        Ok(Some(doc.clone()))
    }

    async fn append(&self, collection: &str, record: Document) -> Result<String, StoreError> {
        let mut state = self.lock()?;
        state.seq = state.seq.saturating_add(1);
        let id = format!("{:020}", state.seq);
        state
            .records
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), record));
        Ok(id)
    }

    async fn recent(
        &self,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .records
            .get(collection)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
