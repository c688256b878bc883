//! Concurrent awards for the same user must not lose updates.

use chrono::Utc;
use std::sync::Arc;
use std::thread;
use xp_ledger_core::{
    category::{CategoryKind, Pillar, Subject},
    event::{CompletionEvent, SubjectDistribution},
    reconciliation::{ReconcileMode, ReconcileScope},
    service::XpService,
    store::XpStore,
};

const THREADS: usize = 12;
const AWARDS_PER_THREAD: usize = 8;

fn completion(thread_no: usize, n: usize, pillar: &str, xp: i64) -> CompletionEvent {
    CompletionEvent {
        id: format!("c-{thread_no}-{n}"),
        user_id: "busy-user".into(),
        task_id: format!("t-{thread_no}-{n}"),
        quest_id: "quest-race".into(),
        pillar: pillar.into(),
        xp_value: xp,
        subject_distribution: Some(SubjectDistribution::EvenSplit(vec!["math".into()])),
        completed_at: Utc::now(),
    }
}

#[test]
fn parallel_awards_sum_exactly() {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(XpStore::in_memory_migrated().unwrap());
    let service = XpService::build_test(store.clone()).unwrap();

    thread::scope(|s| {
        for t in 0..THREADS {
            let service = &service;
            s.spawn(move || {
                for n in 0..AWARDS_PER_THREAD {
                    service.award(&completion(t, n, "stem", 10)).expect("award failed");
                }
            });
        }
    });

    let expected = (THREADS * AWARDS_PER_THREAD * 10) as i64;
    assert_eq!(service.get_xp_by_pillar("busy-user").unwrap()[&Pillar::Stem], expected);
    assert_eq!(service.get_credits_by_subject("busy-user").unwrap()[&Subject::Math], expected);
    assert_eq!(store.ledger_xp_sum("busy-user").unwrap(), expected);

    let report = service.reconcile(Some("busy-user"), true).unwrap();
    assert!(report.discrepancies.is_empty(), "{:?}", report.discrepancies);
}

#[test]
fn same_completion_raced_from_many_threads_counts_once() {
    let store = Arc::new(XpStore::in_memory_migrated().unwrap());
    let service = XpService::build_test(store.clone()).unwrap();
    let event = completion(0, 0, "art", 35);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let (service, event) = (&service, &event);
            s.spawn(move || service.award(event).expect("award failed"));
        }
    });

    assert_eq!(store.ledger_entry_count().unwrap(), 1);
    assert_eq!(store.stored_amount(CategoryKind::Pillar, "busy-user", "art").unwrap(), Some(35));
}

#[test]
fn reconcile_running_alongside_awards_keeps_totals_exact() {
    let store = Arc::new(XpStore::in_memory_migrated().unwrap());
    let service = XpService::build_test(store.clone()).unwrap();

    thread::scope(|s| {
        for t in 0..4 {
            let service = &service;
            s.spawn(move || {
                for n in 0..AWARDS_PER_THREAD {
                    service.award(&completion(t, n, "wellness", 5)).expect("award failed");
                }
            });
        }
        let service = &service;
        s.spawn(move || {
            for _ in 0..5 {
                service
                    .reconcile_with(&ReconcileScope::All, ReconcileMode::Apply, false)
                    .expect("reconcile failed");
            }
        });
    });

    let expected = (4 * AWARDS_PER_THREAD * 5) as i64;
    assert_eq!(service.get_total_xp("busy-user").unwrap(), expected);
    let check = service.reconcile(Some("busy-user"), true).unwrap();
    assert!(check.is_consistent());
}
