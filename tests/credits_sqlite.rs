#![cfg(feature = "store-sqlite")]

use std::sync::Arc;

use merse_credits::credits::{
    CreditAction, CreditCharge, CreditLedger, DocumentStore, LedgerError, PROFILES, SqliteStore,
    USAGE_RECORDS, UsageRecorder, UsageStatus,
};
use merse_credits::observability::Observability;

async fn ledger_at(path: &std::path::Path) -> (CreditLedger, SqliteStore) {
    let store = SqliteStore::new(path);
    store.init().await.expect("init");
    let observability = Arc::new(Observability::default());
    let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
    let usage = UsageRecorder::spawn(shared.clone(), observability.clone());
    (CreditLedger::new(shared, usage, observability), store)
}

#[tokio::test]
async fn balances_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("credits.sqlite");

    {
        let (ledger, _) = ledger_at(&db_path).await;
        let profile = ledger
            .ensure_profile("u-1", Some("pulse"))
            .await
            .expect("ensure")
            .expect("profile");
        assert_eq!(profile.credits, 500);

        let outcome = ledger
            .apply_charges("u-1", &[CreditCharge::new(CreditAction::Model)])
            .await
            .expect("charge");
        assert_eq!(outcome.remaining_credits, 450);
        ledger.usage().flush().await;
    }

    let (ledger, store) = ledger_at(&db_path).await;
    let profile = ledger
        .ensure_profile("u-1", None)
        .await
        .expect("ensure")
        .expect("profile");
    assert_eq!(profile.credits, 450);

    let doc = store.get(PROFILES, "u-1").await.expect("get").expect("doc");
    assert_eq!(doc["generatedCount"], 1);
    assert_eq!(doc["lastCharge"]["totalCost"], 50);

    let records = ledger.usage().recent(10).await.expect("usage");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, UsageStatus::Debited);
    assert_eq!(records[0].balance_after, Some(450));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_charges_never_overdraw() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("credits.sqlite");
    let (ledger, _) = ledger_at(&db_path).await;
    ledger
        .ensure_profile("u-race", Some("free"))
        .await
        .expect("ensure");

    // Free plan: 50 credits, each charge costs 20, so at most two succeed.
    let mut handles = Vec::new();
    for _ in 0..6 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .apply_charges("u-race", &[CreditCharge::new(CreditAction::Site)])
                .await
        }));
    }

    let mut succeeded = 0u64;
    let mut rejected = 0u64;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientCredits { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(succeeded, 2);
    assert_eq!(rejected, 4);

    let profile = ledger
        .ensure_profile("u-race", None)
        .await
        .expect("ensure")
        .expect("profile");
    assert_eq!(profile.credits, 10);

    ledger.usage().flush().await;
    let (_, store) = ledger_at(&db_path).await;
    let records = store.recent(USAGE_RECORDS, 100).await.expect("records");
    assert_eq!(records.len(), 6);
}
