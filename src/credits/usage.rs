use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::store::{Document, DocumentStore, StoreError};
use crate::observability::Observability;

pub const USAGE_RECORDS: &str = "usage_records";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Debited,
    SkippedNoUser,
    NoProfile,
    InsufficientBalance,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub user_id: Option<String>,
    pub product: String,
    pub amount: u64,
    pub status: UsageStatus,
    #[serde(default)]
    pub metadata: Document,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<u64>,
}

enum UsageCommand {
    Record(UsageRecord),
    Flush(oneshot::Sender<()>),
}

/// Best-effort audit trail.
///
/// Records are queued to a background task that appends them in order. Append
/// failures are logged and counted in [`Observability`], never returned: the
/// ledger result stands regardless of what happens here.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn DocumentStore>,
    queue: mpsc::UnboundedSender<UsageCommand>,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder")
            .field("queue_closed", &self.queue.is_closed())
            .finish()
    }
}

impl UsageRecorder {
    /// Starts the append worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn DocumentStore>, observability: Arc<Observability>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(store.clone(), rx, observability.clone()));
        Self {
            store,
            queue,
            observability,
        }
    }

    pub fn record(&self, record: UsageRecord) {
        if self.queue.send(UsageCommand::Record(record)).is_err() {
            tracing::warn!("usage recorder worker stopped; dropping usage record");
            self.observability.record_audit_failure();
        }
    }

    /// Waits until every record queued before this call has been handled.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(UsageCommand::Flush(done)).is_err() {
            return;
        }
        let _ = wait.await;
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        let rows = self.store.recent(USAGE_RECORDS, limit.clamp(1, 1000)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (_id, doc) in rows {
            out.push(serde_json::from_value(serde_json::Value::Object(doc))?);
        }
        Ok(out)
    }
}

async fn run_worker(
    store: Arc<dyn DocumentStore>,
    mut rx: mpsc::UnboundedReceiver<UsageCommand>,
    observability: Arc<Observability>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            UsageCommand::Record(record) => {
                append_record(store.as_ref(), &record, &observability).await;
            }
            UsageCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn append_record(
    store: &dyn DocumentStore,
    record: &UsageRecord,
    observability: &Observability,
) {
    let doc = match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(doc)) => doc,
        Ok(_) => Document::new(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode usage record");
            observability.record_audit_failure();
            return;
        }
    };
    if let Err(err) = store.append(USAGE_RECORDS, doc).await {
        tracing::warn!(
            error = %err,
            user_id = record.user_id.as_deref().unwrap_or("-"),
            status = ?record.status,
            "usage record append failed"
        );
        observability.record_audit_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::store::MemoryStore;

    fn record(status: UsageStatus) -> UsageRecord {
        UsageRecord {
            user_id: Some("u1".to_string()),
            product: "image".to_string(),
            amount: 3,
            status,
            metadata: Document::new(),
            created_at: 1_000,
            balance_after: None,
        }
    }

    #[tokio::test]
    async fn flush_waits_for_queued_records() {
        let store = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::spawn(store.clone(), Arc::new(Observability::default()));

        recorder.record(record(UsageStatus::NoProfile));
        recorder.record(record(UsageStatus::Debited));
        recorder.flush().await;

        let recent = recorder.recent(10).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, UsageStatus::Debited);
        assert_eq!(recent[1].status, UsageStatus::NoProfile);
    }

    #[test]
    fn status_serializes_snake_case() {
        let value = serde_json::to_value(record(UsageStatus::SkippedNoUser)).expect("json");
        assert_eq!(value["status"], "skipped_no_user");
        assert_eq!(value["userId"], "u1");
        assert!(value.get("balanceAfter").is_none());
    }
}
