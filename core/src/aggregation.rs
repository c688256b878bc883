//! Aggregation engine: derives authoritative totals from the ledger.
//!
//! Design:
//!   - Full recompute folds every ledger entry for a user.
//!   - Incremental fold covers only entries with seq > watermark. For rows
//!     that reflect exactly the entries up to the watermark,
//!     stored + increment == full recompute.
//!   - Unresolved categories are skipped and returned, never bucketed.
//!   - Pure over the entries it is given; the only I/O is the ledger read.

use crate::{
    category::{Category, CategoryKind, CategoryResolver, Pillar, Subject, UnresolvedCategory},
    distribution,
    error::XpResult,
    event::{CompletionEvent, LedgerEntry},
    store::{AggregateWrite, CompletionLedger},
    types::{CompletionId, LedgerSeq, UserId, Xp},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What one completion contributes to each category.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventCredit {
    pub pillar:     Option<Pillar>,
    pub pillar_xp:  Xp,
    pub subjects:   BTreeMap<Subject, Xp>,
    pub unresolved: Vec<UnresolvedCategory>,
}

/// A ledger entry whose category could not be placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedEntry {
    pub user_id:       UserId,
    pub completion_id: CompletionId,
    pub seq:           LedgerSeq,
    pub category:      UnresolvedCategory,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserTotals {
    pub user_id:        UserId,
    pub pillar_totals:  BTreeMap<Pillar, Xp>,
    pub subject_totals: BTreeMap<Subject, Xp>,
    /// Highest seq folded, or the starting watermark if nothing was.
    pub through_seq:    LedgerSeq,
    pub events_folded:  usize,
    pub unresolved:     Vec<UnresolvedEntry>,
}

impl UserTotals {
    pub fn total_xp(&self) -> Xp {
        self.pillar_totals.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pillar_totals.is_empty() && self.subject_totals.is_empty()
    }

    pub fn amount(&self, category: Category) -> Xp {
        match category {
            Category::Pillar(p)  => self.pillar_totals.get(&p).copied().unwrap_or(0),
            Category::Subject(s) => self.subject_totals.get(&s).copied().unwrap_or(0),
        }
    }

    /// Every non-zero total as a store write, pillars first.
    pub fn writes(&self) -> Vec<AggregateWrite> {
        let pillars = self.pillar_totals.iter().map(|(p, amount)| AggregateWrite {
            kind: CategoryKind::Pillar,
            category: p.as_str().to_string(),
            amount: *amount,
        });
        let subjects = self.subject_totals.iter().map(|(s, amount)| AggregateWrite {
            kind: CategoryKind::Subject,
            category: s.as_str().to_string(),
            amount: *amount,
        });
        pillars.chain(subjects).filter(|w| w.amount > 0).collect()
    }
}

/// Resolve and distribute a single completion.
pub fn credit_for_event(resolver: &CategoryResolver, event: &CompletionEvent) -> EventCredit {
    let mut credit = EventCredit::default();

    match resolver.resolve_pillar(&event.pillar) {
        Ok(p) => {
            credit.pillar = Some(p);
            credit.pillar_xp = event.xp_value.max(0);
        }
        Err(unresolved) => credit.unresolved.push(unresolved),
    }

    if let Some(dist) = &event.subject_distribution {
        for (raw, amount) in distribution::compute(event.xp_value, dist) {
            match resolver.resolve_subject(&raw) {
                Ok(s) => {
                    if amount > 0 {
                        *credit.subjects.entry(s).or_insert(0) += amount;
                    }
                }
                Err(unresolved) => credit.unresolved.push(unresolved),
            }
        }
    }

    credit
}

/// Fold ledger entries with seq > `after_seq` into totals.
pub fn fold(
    resolver: &CategoryResolver,
    user_id: &str,
    after_seq: LedgerSeq,
    entries: &[LedgerEntry],
) -> UserTotals {
    let mut totals = UserTotals {
        user_id: user_id.to_string(),
        through_seq: after_seq,
        ..Default::default()
    };

    for entry in entries {
        if entry.seq <= after_seq || entry.event.user_id != user_id {
            continue;
        }
        let credit = credit_for_event(resolver, &entry.event);

        if let Some(p) = credit.pillar {
            if credit.pillar_xp > 0 {
                *totals.pillar_totals.entry(p).or_insert(0) += credit.pillar_xp;
            }
        }
        for (s, amount) in credit.subjects {
            *totals.subject_totals.entry(s).or_insert(0) += amount;
        }
        for category in credit.unresolved {
            totals.unresolved.push(UnresolvedEntry {
                user_id: user_id.to_string(),
                completion_id: entry.event.id.clone(),
                seq: entry.seq,
                category,
            });
        }

        totals.through_seq = totals.through_seq.max(entry.seq);
        totals.events_folded += 1;
    }

    totals
}

pub struct AggregationEngine {
    resolver: Arc<CategoryResolver>,
    ledger:   Arc<dyn CompletionLedger>,
}

impl AggregationEngine {
    pub fn new(resolver: Arc<CategoryResolver>, ledger: Arc<dyn CompletionLedger>) -> Self {
        Self { resolver, ledger }
    }

    pub fn resolver(&self) -> &CategoryResolver {
        &self.resolver
    }

    /// Authoritative totals over the whole ledger for one user.
    pub fn compute_user_totals(&self, user_id: &str) -> XpResult<UserTotals> {
        self.compute_increment(user_id, 0)
    }

    /// Totals over entries with seq > `after_seq` only.
    pub fn compute_increment(&self, user_id: &str, after_seq: LedgerSeq) -> XpResult<UserTotals> {
        let entries = self.ledger.entries_for_user(user_id, after_seq)?;
        let totals = fold(&self.resolver, user_id, after_seq, &entries);
        log::debug!(
            "user={user_id} folded {} entries after seq {after_seq} (through {})",
            totals.events_folded,
            totals.through_seq
        );
        Ok(totals)
    }
}
