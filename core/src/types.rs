//! Shared primitive types used across the engine.

/// Position of an entry in the completion ledger. Strictly increasing.
pub type LedgerSeq = i64;

/// An XP or credit amount. Always non-negative once materialized.
pub type Xp = i64;

pub type UserId = String;

/// The completion id assigned by the task subsystem.
pub type CompletionId = String;
