//! XP award coordinator: the synchronous write path for a completion.
//!
//! Steps:
//!   1. Validate: ids, xp > 0, pillar and every subject key resolve,
//!      distribution well-formed. Nothing is written on failure.
//!   2. Append to the ledger. A repeated completion id or
//!      (user, task, canonical pillar) is ignored, which makes replays
//!      harmless.
//!   3. Refresh the user's aggregates from the ledger after the stored
//!      watermark, committed with compare-and-set on that watermark.
//!
//! Once step 2 succeeds the completion is durable. A failure in step 3 is
//! reported as PartialAwardFailure and heals on the next award for the
//! user or the next reconciliation sweep.

use crate::{
    aggregation::{credit_for_event, AggregationEngine},
    category::{Pillar, Subject},
    clock::Clock,
    config::AwardConfig,
    distribution,
    error::{XpError, XpResult},
    event::{AppendOutcome, CompletionEvent},
    store::{AggregateStore, AggregateUpdate, CommitOutcome, CompletionLedger, WriteMode},
    types::{CompletionId, LedgerSeq, UserId, Xp},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardResult {
    pub completion_id:   CompletionId,
    pub user_id:         UserId,
    pub seq:             LedgerSeq,
    /// The completion was already in the ledger; nothing new was counted.
    pub duplicate:       bool,
    pub pillar:          Pillar,
    pub pillar_xp:       Xp,
    pub subject_credits: BTreeMap<Subject, Xp>,
    /// User watermark after the refresh.
    pub watermark:       LedgerSeq,
}

/// A completion that passed validation, with what it will contribute.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedAward {
    pub pillar:          Pillar,
    pub pillar_xp:       Xp,
    pub subject_credits: BTreeMap<Subject, Xp>,
}

pub struct XpAwardCoordinator {
    engine: Arc<AggregationEngine>,
    ledger: Arc<dyn CompletionLedger>,
    store:  Arc<dyn AggregateStore>,
    clock:  Arc<dyn Clock>,
    config: AwardConfig,
}

impl XpAwardCoordinator {
    pub fn new(
        engine: Arc<AggregationEngine>,
        ledger: Arc<dyn CompletionLedger>,
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
        config: AwardConfig,
    ) -> Self {
        Self { engine, ledger, store, clock, config }
    }

    pub fn validate(&self, event: &CompletionEvent) -> XpResult<ValidatedAward> {
        let reject = |reason: String| XpError::Validation {
            completion_id: event.id.clone(),
            reason,
        };

        if event.id.trim().is_empty() {
            return Err(reject("blank completion id".into()));
        }
        if event.user_id.trim().is_empty() || event.task_id.trim().is_empty() {
            return Err(reject("blank user or task id".into()));
        }
        if event.xp_value <= 0 {
            return Err(reject(format!("xp_value must be positive, got {}", event.xp_value)));
        }

        let resolver = self.engine.resolver();
        let pillar = resolver.resolve_pillar(&event.pillar)?;

        if let Some(dist) = &event.subject_distribution {
            distribution::validate(dist)
                .map_err(|m| reject(format!("malformed subject distribution: {m}")))?;
            for raw in dist.subject_keys() {
                resolver.resolve_subject(raw)?;
            }
        }

        let credit = credit_for_event(resolver, event);
        Ok(ValidatedAward {
            pillar,
            pillar_xp: credit.pillar_xp,
            subject_credits: credit.subjects,
        })
    }

    pub fn award(&self, event: &CompletionEvent) -> XpResult<AwardResult> {
        let validated = self.validate(event)?;

        let outcome = self
            .ledger
            .append(event, validated.pillar.as_str(), self.clock.now())?;
        let duplicate = matches!(outcome, AppendOutcome::Duplicate { .. });
        let credited = if duplicate {
            log::info!(
                "completion {} for user={} already in ledger at seq {}; not counted again",
                event.id,
                event.user_id,
                outcome.seq()
            );
            self.stored_credit(outcome.seq(), validated.pillar)?
        } else {
            validated
        };

        let watermark = match self.refresh(&event.user_id) {
            Ok(w) => w,
            Err(e) => {
                log::warn!(
                    "completion {} recorded at seq {} but aggregates for user={} are stale: {e}",
                    event.id,
                    outcome.seq(),
                    event.user_id
                );
                return Err(XpError::PartialAwardFailure {
                    completion_id: event.id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        log::debug!(
            "awarded {} xp ({}) to user={} seq={} watermark={watermark}",
            credited.pillar_xp,
            credited.pillar,
            event.user_id,
            outcome.seq()
        );

        Ok(AwardResult {
            completion_id: event.id.clone(),
            user_id: event.user_id.clone(),
            seq: outcome.seq(),
            duplicate,
            pillar: credited.pillar,
            pillar_xp: credited.pillar_xp,
            subject_credits: credited.subject_credits,
            watermark,
        })
    }

    /// What the entry already in the ledger at `seq` contributed. A replay
    /// reports this, not the values carried by the repeated event.
    fn stored_credit(&self, seq: LedgerSeq, pillar: Pillar) -> XpResult<ValidatedAward> {
        let Some(stored) = self.ledger.entry(seq)? else {
            return Ok(ValidatedAward {
                pillar,
                pillar_xp: 0,
                subject_credits: BTreeMap::new(),
            });
        };
        let credit = credit_for_event(self.engine.resolver(), &stored.event);
        Ok(ValidatedAward {
            pillar: credit.pillar.unwrap_or(pillar),
            pillar_xp: credit.pillar_xp,
            subject_credits: credit.subjects,
        })
    }

    /// Bring the user's aggregates up to the ledger head through the
    /// incremental path. Returns the watermark afterwards.
    pub fn refresh(&self, user_id: &str) -> XpResult<LedgerSeq> {
        let timeout = self.config.store_timeout();
        let deadline = Instant::now() + timeout;

        for attempt in 1..=self.config.max_commit_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return Err(XpError::StoreTimeout {
                    timeout_ms: self.config.store_timeout_ms,
                });
            }

            let base = self.store.watermark(user_id)?;
            let increment = self.engine.compute_increment(user_id, base)?;
            let writes = increment.writes();
            if writes.is_empty() {
                return Ok(base);
            }

            let update = AggregateUpdate {
                user_id: user_id.to_string(),
                base_seq: base,
                through_seq: increment.through_seq,
                mode: WriteMode::Increment,
                writes,
                updated_at: self.clock.now(),
            };

            match self.store.commit(&update, remaining)? {
                CommitOutcome::Committed => return Ok(increment.through_seq),
                CommitOutcome::Conflict { current_seq } => {
                    log::debug!(
                        "user={user_id} watermark moved {base} -> {current_seq} (attempt {attempt}); retrying"
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
