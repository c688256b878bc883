//! Completion events: the only input the engine consumes.
//!
//! RULE: A CompletionEvent is immutable once appended to the ledger.
//! Aggregates are always derived from ledger entries, never from
//! caller-supplied deltas.

use crate::types::{CompletionId, LedgerSeq, UserId, Xp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a task's XP is split across academic subjects.
///
/// JSON shape decides the mode: an object is a percentage map,
/// an array is an even split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubjectDistribution {
    /// subject → percentage in 0..=100. Need not sum to 100.
    Percentages(BTreeMap<String, f64>),
    /// Each listed subject receives an equal integer share.
    EvenSplit(Vec<String>),
}

impl SubjectDistribution {
    pub fn is_empty(&self) -> bool {
        match self {
            SubjectDistribution::Percentages(m) => m.is_empty(),
            SubjectDistribution::EvenSplit(v)   => v.is_empty(),
        }
    }

    /// Raw subject keys in the order they will be credited.
    pub fn subject_keys(&self) -> Vec<&str> {
        match self {
            SubjectDistribution::Percentages(m) => m.keys().map(String::as_str).collect(),
            SubjectDistribution::EvenSplit(v)   => v.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub id:           CompletionId,
    pub user_id:      UserId,
    pub task_id:      String,
    pub quest_id:     String,
    /// Raw pillar string as the task subsystem supplied it.
    pub pillar:       String,
    pub xp_value:     Xp,
    #[serde(default)]
    pub subject_distribution: Option<SubjectDistribution>,
    pub completed_at: DateTime<Utc>,
}

/// A completion event as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq:         LedgerSeq,
    pub recorded_at: DateTime<Utc>,
    pub event:       CompletionEvent,
}

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    Appended { seq: LedgerSeq },
    /// Same completion id, or same (user, task, canonical pillar), already in the ledger.
    Duplicate { seq: LedgerSeq },
}

impl AppendOutcome {
    pub fn seq(self) -> LedgerSeq {
        match self {
            AppendOutcome::Appended { seq } | AppendOutcome::Duplicate { seq } => seq,
        }
    }
}
