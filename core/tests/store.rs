//! Connection settings survive aggregate commits.

use chrono::Utc;
use std::time::Duration;
use xp_ledger_core::{
    category::CategoryKind,
    store::{AggregateStore, AggregateUpdate, AggregateWrite, CommitOutcome, WriteMode, XpStore},
};

const DEFAULT_BUSY_TIMEOUT_MS: i64 = 5_000;

fn update(base_seq: i64) -> AggregateUpdate {
    AggregateUpdate {
        user_id: "u1".into(),
        base_seq,
        through_seq: base_seq,
        mode: WriteMode::Overwrite,
        writes: vec![AggregateWrite {
            kind: CategoryKind::Pillar,
            category: "stem".into(),
            amount: 10,
        }],
        updated_at: Utc::now(),
    }
}

#[test]
fn commit_restores_default_busy_timeout() {
    let store = XpStore::in_memory_migrated().unwrap();
    assert_eq!(store.busy_timeout_ms().unwrap(), DEFAULT_BUSY_TIMEOUT_MS);

    let outcome = store.commit(&update(0), Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, CommitOutcome::Committed);
    assert_eq!(store.busy_timeout_ms().unwrap(), DEFAULT_BUSY_TIMEOUT_MS);
}

#[test]
fn conflicting_commit_restores_default_busy_timeout() {
    let store = XpStore::in_memory_migrated().unwrap();

    let outcome = store.commit(&update(7), Duration::from_millis(250)).unwrap();
    assert_eq!(outcome, CommitOutcome::Conflict { current_seq: 0 });
    assert_eq!(store.busy_timeout_ms().unwrap(), DEFAULT_BUSY_TIMEOUT_MS);
    assert_eq!(store.stored_amount(CategoryKind::Pillar, "u1", "stem").unwrap(), None);
}

#[test]
fn failed_commit_restores_default_busy_timeout() {
    let store = XpStore::in_memory_migrated().unwrap();
    let mut bad = update(0);
    // Negative amounts fail the xp_amount CHECK inside the transaction.
    bad.writes[0].amount = -10;
    assert!(store.commit(&bad, Duration::from_millis(250)).is_err());
    assert_eq!(store.busy_timeout_ms().unwrap(), DEFAULT_BUSY_TIMEOUT_MS);
    assert_eq!(store.aggregate_row_count(CategoryKind::Pillar).unwrap(), 0);
}

#[test]
fn in_memory_store_has_no_path() {
    let store = XpStore::in_memory().unwrap();
    assert_eq!(store.path(), None);
}
