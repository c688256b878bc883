//! Reconciliation service: compares ledger-derived totals against the
//! materialized aggregates and, in Apply mode, repairs them.
//!
//! Design:
//!   - Expected = AggregationEngine full recompute for the user
//!   - Actual   = stored row amount (missing row reads as 0)
//!   - expected != actual → Discrepancy, always logged
//!   - Apply overwrites mismatching rows with the expected value and stamps
//!     updated_at / ledger_seq; never additive, so re-runs are no-ops
//!   - Net-negative corrections are held back unless the run is confirmed
//!   - Writes are compare-and-set on the user watermark, same as awards
//!   - One user's failure is recorded in the report, the sweep continues

use crate::{
    aggregation::{AggregationEngine, UnresolvedEntry, UserTotals},
    category::{CategoryKind, VOCABULARY_VERSION},
    clock::Clock,
    config::ReconciliationConfig,
    error::{XpError, XpResult},
    store::{
        AggregateRecord, AggregateStore, AggregateUpdate, AggregateWrite, CommitOutcome,
        CompletionLedger, WriteMode,
    },
    types::{LedgerSeq, UserId, Xp},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    DryRun,
    Apply,
}

impl ReconcileMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            ReconcileMode::DryRun
        } else {
            ReconcileMode::Apply
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "user_id", rename_all = "snake_case")]
pub enum ReconcileScope {
    /// One user, regardless of staleness.
    User(UserId),
    /// Users whose ledger head is past their aggregate watermark.
    Stale,
    /// Every user present in the ledger or the aggregate tables.
    All,
}

/// A mismatch between the ledger and a stored aggregate row.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("user '{user_id}' {kind} '{category}': ledger total {expected}, stored {actual} (delta {delta})")]
pub struct Discrepancy {
    pub user_id:  UserId,
    pub kind:     CategoryKind,
    pub category: String,
    pub expected: Xp,
    pub actual:   Xp,
    /// expected - actual. Negative means the store is over-awarded.
    pub delta:    Xp,
}

impl Discrepancy {
    pub fn is_reduction(&self) -> bool {
        self.delta < 0
    }
}

/// One row written by an Apply run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id:     UserId,
    pub kind:        CategoryKind,
    pub category:    String,
    /// None when the row did not exist.
    pub before:      Option<Xp>,
    pub after:       Xp,
    pub through_seq: LedgerSeq,
    pub written_at:  DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUser {
    pub user_id: UserId,
    pub error:   String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id:             Uuid,
    pub mode:               ReconcileMode,
    pub scope:              ReconcileScope,
    pub confirm_reductions: bool,
    pub vocabulary_version: u32,
    pub started_at:         DateTime<Utc>,
    pub finished_at:        DateTime<Utc>,
    pub users_scanned:      usize,
    pub discrepancies:      Vec<Discrepancy>,
    pub writes:             Vec<AuditEntry>,
    /// Over-award corrections that need operator sign-off.
    pub held_reductions:    Vec<Discrepancy>,
    pub unresolved:         Vec<UnresolvedEntry>,
    pub failed_users:       Vec<FailedUser>,
}

impl ReconciliationReport {
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// True when the stores match the ledger for every scanned user
    /// after this run.
    pub fn is_consistent(&self) -> bool {
        let repaired = match self.mode {
            ReconcileMode::DryRun => self.discrepancies.is_empty(),
            ReconcileMode::Apply  => self.held_reductions.is_empty(),
        };
        repaired && self.failed_users.is_empty()
    }

    /// Turn an unrepaired discrepancy or a failed user into an error.
    pub fn into_result(self) -> XpResult<Self> {
        if let Some(failed) = self.failed_users.first() {
            return Err(XpError::Other(anyhow::anyhow!(
                "reconciliation failed for user '{}': {}",
                failed.user_id,
                failed.error
            )));
        }
        let outstanding = match self.mode {
            ReconcileMode::DryRun => self.discrepancies.first(),
            ReconcileMode::Apply  => self.held_reductions.first(),
        };
        if let Some(d) = outstanding {
            return Err(XpError::Consistency(d.clone()));
        }
        Ok(self)
    }
}

/// Everything found for a single user.
struct UserOutcome {
    discrepancies: Vec<Discrepancy>,
    writes:        Vec<AuditEntry>,
    held:          Vec<Discrepancy>,
    unresolved:    Vec<UnresolvedEntry>,
}

pub struct ReconciliationService {
    engine: Arc<AggregationEngine>,
    ledger: Arc<dyn CompletionLedger>,
    store:  Arc<dyn AggregateStore>,
    clock:  Arc<dyn Clock>,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    pub fn new(
        engine: Arc<AggregationEngine>,
        ledger: Arc<dyn CompletionLedger>,
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
        config: ReconciliationConfig,
    ) -> Self {
        Self { engine, ledger, store, clock, config }
    }

    pub fn reconcile(
        &self,
        scope: &ReconcileScope,
        mode: ReconcileMode,
        confirm_reductions: bool,
    ) -> XpResult<ReconciliationReport> {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let users = self.select_users(scope)?;

        log::info!(
            "reconcile run={run_id} mode={mode:?} scope={scope:?}: {} users in scope",
            users.len()
        );

        let mut report = ReconciliationReport {
            run_id,
            mode,
            scope: scope.clone(),
            confirm_reductions,
            vocabulary_version: VOCABULARY_VERSION,
            started_at,
            finished_at: started_at,
            users_scanned: 0,
            discrepancies: Vec::new(),
            writes: Vec::new(),
            held_reductions: Vec::new(),
            unresolved: Vec::new(),
            failed_users: Vec::new(),
        };

        for (batch_no, batch) in users.chunks(self.config.batch_size.max(1)).enumerate() {
            for user_id in batch {
                report.users_scanned += 1;
                match self.reconcile_user(user_id, mode, confirm_reductions) {
                    Ok(outcome) => {
                        report.discrepancies.extend(outcome.discrepancies);
                        report.writes.extend(outcome.writes);
                        report.held_reductions.extend(outcome.held);
                        report.unresolved.extend(outcome.unresolved);
                    }
                    Err(e) => {
                        log::error!("reconcile run={run_id} user={user_id} failed: {e}");
                        report.failed_users.push(FailedUser {
                            user_id: user_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
            log::debug!(
                "reconcile run={run_id} batch {batch_no} done ({} users so far)",
                report.users_scanned
            );
        }

        report.finished_at = self.clock.now();
        log::info!(
            "reconcile run={run_id} finished: {} users, {} discrepancies, {} writes, {} held, {} failed",
            report.users_scanned,
            report.discrepancies.len(),
            report.writes.len(),
            report.held_reductions.len(),
            report.failed_users.len()
        );
        Ok(report)
    }

    fn select_users(&self, scope: &ReconcileScope) -> XpResult<Vec<UserId>> {
        match scope {
            ReconcileScope::User(user_id) => Ok(vec![user_id.clone()]),
            ReconcileScope::Stale => {
                let watermarks: BTreeMap<UserId, LedgerSeq> =
                    self.store.watermarks()?.into_iter().collect();
                Ok(self
                    .ledger
                    .ledger_heads()?
                    .into_iter()
                    .filter(|(user_id, head)| {
                        *head > watermarks.get(user_id).copied().unwrap_or(0)
                    })
                    .map(|(user_id, _)| user_id)
                    .collect())
            }
            ReconcileScope::All => {
                let mut users: BTreeSet<UserId> = self
                    .ledger
                    .ledger_heads()?
                    .into_iter()
                    .map(|(user_id, _)| user_id)
                    .collect();
                users.extend(self.store.watermarks()?.into_iter().map(|(user_id, _)| user_id));
                Ok(users.into_iter().collect())
            }
        }
    }

    fn reconcile_user(
        &self,
        user_id: &str,
        mode: ReconcileMode,
        confirm_reductions: bool,
    ) -> XpResult<UserOutcome> {
        let needs_signoff = self.config.require_signoff_for_reductions && !confirm_reductions;

        for attempt in 1..=self.config.max_commit_attempts {
            let base = self.store.watermark(user_id)?;
            let totals = self.engine.compute_user_totals(user_id)?;
            let mut stored = self.store.records(CategoryKind::Pillar, user_id)?;
            stored.extend(self.store.records(CategoryKind::Subject, user_id)?);

            let discrepancies = compare(&totals, &stored);
            for d in &discrepancies {
                log::warn!("consistency: {d}");
            }

            let (held, to_write): (Vec<_>, Vec<_>) = discrepancies
                .iter()
                .cloned()
                .partition(|d| needs_signoff && d.is_reduction());

            if mode == ReconcileMode::DryRun || to_write.is_empty() {
                for d in &held {
                    log::warn!("held for sign-off: {d}");
                }
                return Ok(UserOutcome {
                    discrepancies,
                    writes: Vec::new(),
                    held: if mode == ReconcileMode::Apply { held } else { Vec::new() },
                    unresolved: totals.unresolved,
                });
            }

            let through_seq = totals.through_seq.max(base);
            let written_at = self.clock.now();
            let update = AggregateUpdate {
                user_id: user_id.to_string(),
                base_seq: base,
                through_seq,
                mode: WriteMode::Overwrite,
                writes: to_write
                    .iter()
                    .map(|d| AggregateWrite {
                        kind: d.kind,
                        category: d.category.clone(),
                        amount: d.expected,
                    })
                    .collect(),
                updated_at: written_at,
            };

            match self.store.commit(&update, self.config.store_timeout())? {
                CommitOutcome::Committed => {
                    let before: BTreeMap<(CategoryKind, &str), Xp> = stored
                        .iter()
                        .map(|r| ((r.kind, r.category.as_str()), r.xp_amount))
                        .collect();
                    let writes = to_write
                        .iter()
                        .map(|d| {
                            let before = before.get(&(d.kind, d.category.as_str())).copied();
                            log::info!(
                                "repaired user={} {} '{}': {} -> {} (through seq {through_seq})",
                                d.user_id,
                                d.kind,
                                d.category,
                                before.map_or_else(|| "none".to_string(), |v| v.to_string()),
                                d.expected
                            );
                            AuditEntry {
                                user_id: d.user_id.clone(),
                                kind: d.kind,
                                category: d.category.clone(),
                                before,
                                after: d.expected,
                                through_seq,
                                written_at,
                            }
                        })
                        .collect();
                    for d in &held {
                        log::warn!("held for sign-off: {d}");
                    }
                    return Ok(UserOutcome {
                        discrepancies,
                        writes,
                        held,
                        unresolved: totals.unresolved,
                    });
                }
                CommitOutcome::Conflict { current_seq } => {
                    log::debug!(
                        "user={user_id} watermark moved {base} -> {current_seq} during reconcile (attempt {attempt})"
                    );
                }
            }
        }

        Err(XpError::CommitContention {
            user_id: user_id.to_string(),
            attempts: self.config.max_commit_attempts,
        })
    }
}

/// Every (kind, category) where the stored amount differs from the ledger
/// total. Rows without ledger support are expected to be 0.
pub fn compare(totals: &UserTotals, stored: &[AggregateRecord]) -> Vec<Discrepancy> {
    let mut actual: BTreeMap<(CategoryKind, String), Xp> = BTreeMap::new();
    for record in stored {
        actual.insert((record.kind, record.category.clone()), record.xp_amount);
    }

    let mut expected: BTreeMap<(CategoryKind, String), Xp> = BTreeMap::new();
    for (p, amount) in &totals.pillar_totals {
        expected.insert((CategoryKind::Pillar, p.as_str().to_string()), *amount);
    }
    for (s, amount) in &totals.subject_totals {
        expected.insert((CategoryKind::Subject, s.as_str().to_string()), *amount);
    }

    let keys: BTreeSet<(CategoryKind, String)> =
        actual.keys().chain(expected.keys()).cloned().collect();

    keys.into_iter()
        .filter_map(|key| {
            let expected = expected.get(&key).copied().unwrap_or(0);
            let actual = actual.get(&key).copied().unwrap_or(0);
            if expected == actual {
                return None;
            }
            let (kind, category) = key;
            Some(Discrepancy {
                user_id: totals.user_id.clone(),
                kind,
                category,
                expected,
                actual,
                delta: expected - actual,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{Pillar, Subject};
    use chrono::{TimeZone, Utc};

    fn record(kind: CategoryKind, category: &str, amount: Xp) -> AggregateRecord {
        AggregateRecord {
            user_id: "u1".into(),
            kind,
            category: category.into(),
            xp_amount: amount,
            ledger_seq: 1,
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn totals(pillars: &[(Pillar, Xp)], subjects: &[(Subject, Xp)]) -> UserTotals {
        UserTotals {
            user_id: "u1".into(),
            pillar_totals: pillars.iter().copied().collect(),
            subject_totals: subjects.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn compare_reports_under_and_over_awards() {
        let t = totals(&[(Pillar::Stem, 500)], &[(Subject::Math, 100)]);
        let stored = vec![
            record(CategoryKind::Pillar, "stem", 400),
            record(CategoryKind::Pillar, "art", 20),
            record(CategoryKind::Subject, "math", 100),
        ];
        let d = compare(&t, &stored);
        assert_eq!(d.len(), 2);

        let stem = d.iter().find(|x| x.category == "stem").unwrap();
        assert_eq!((stem.expected, stem.actual, stem.delta), (500, 400, 100));
        assert!(!stem.is_reduction());

        let art = d.iter().find(|x| x.category == "art").unwrap();
        assert_eq!((art.expected, art.actual, art.delta), (0, 20, -20));
        assert!(art.is_reduction());
    }

    #[test]
    fn compare_treats_missing_rows_as_zero() {
        let t = totals(&[(Pillar::Civics, 30)], &[]);
        let d = compare(&t, &[]);
        assert_eq!(d.len(), 1);
        assert_eq!((d[0].expected, d[0].actual), (30, 0));
        assert!(compare(&totals(&[], &[]), &[record(CategoryKind::Subject, "pe", 0)]).is_empty());
    }
}
