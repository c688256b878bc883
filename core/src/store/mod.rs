//! SQLite persistence layer.
//!
//! RULE: Only the store module talks to the database.
//! The award path and reconciliation go through the `CompletionLedger`
//! and `AggregateStore` traits; they never execute SQL directly.

use crate::{
    category::CategoryKind,
    error::{XpError, XpResult},
    event::{AppendOutcome, CompletionEvent, LedgerEntry},
    types::{LedgerSeq, UserId, Xp},
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

mod aggregate;
mod ledger;

/// Busy timeout for untimed operations on file databases.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ── Seams ──────────────────────────────────────────────────────────

/// The append-only completion log.
pub trait CompletionLedger: Send + Sync {
    /// Append unless the completion id or (user, task, `pillar_key`) is
    /// already present. `pillar_key` is the canonical pillar the event's
    /// raw pillar resolved to.
    fn append(
        &self,
        event: &CompletionEvent,
        pillar_key: &str,
        recorded_at: DateTime<Utc>,
    ) -> XpResult<AppendOutcome>;

    /// Entries for one user with `seq > after_seq`, ascending.
    fn entries_for_user(&self, user_id: &str, after_seq: LedgerSeq) -> XpResult<Vec<LedgerEntry>>;

    /// Highest seq per user, for every user in the ledger.
    fn ledger_heads(&self) -> XpResult<Vec<(UserId, LedgerSeq)>>;

    fn entry(&self, seq: LedgerSeq) -> XpResult<Option<LedgerEntry>>;
}

/// The two materialized aggregate tables.
pub trait AggregateStore: Send + Sync {
    fn records(&self, kind: CategoryKind, user_id: &str) -> XpResult<Vec<AggregateRecord>>;

    /// Highest `ledger_seq` over the user's rows in both tables, 0 if none.
    fn watermark(&self, user_id: &str) -> XpResult<LedgerSeq>;

    /// Watermark for every user that has at least one aggregate row.
    fn watermarks(&self) -> XpResult<Vec<(UserId, LedgerSeq)>>;

    /// Apply `update` atomically if the user's watermark still equals
    /// `update.base_seq`. Fails with `StoreTimeout` past `timeout`.
    fn commit(&self, update: &AggregateUpdate, timeout: Duration) -> XpResult<CommitOutcome>;
}

// ── Rows ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub user_id:    UserId,
    pub kind:       CategoryKind,
    /// Stored key. Canonical for rows this engine wrote; legacy rows may differ.
    pub category:   String,
    pub xp_amount:  Xp,
    pub ledger_seq: LedgerSeq,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Add `amount` to the stored value (award path).
    Increment,
    /// Replace the stored value with `amount` (reconciliation).
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateWrite {
    pub kind:     CategoryKind,
    pub category: String,
    pub amount:   Xp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateUpdate {
    pub user_id:    UserId,
    /// Watermark the update was computed against.
    pub base_seq:   LedgerSeq,
    /// Highest ledger seq reflected once the update lands.
    pub through_seq: LedgerSeq,
    pub mode:       WriteMode,
    pub writes:     Vec<AggregateWrite>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    /// Someone else moved the watermark first. Recompute and retry.
    Conflict { current_seq: LedgerSeq },
}

// ── Store handle ───────────────────────────────────────────────────

pub struct XpStore {
    conn: Mutex<Connection>,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl XpStore {
    pub fn open(path: &str) -> XpResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> XpResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// In-memory database with migrations applied.
    pub fn in_memory_migrated() -> XpResult<Self> {
        let store = Self::in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Current SQLite busy timeout of the connection, in milliseconds.
    pub fn busy_timeout_ms(&self) -> XpResult<i64> {
        let ms: i64 = self.lock().query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
        Ok(ms)
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> XpResult<()> {
        let conn = self.lock();
        conn.execute_batch(include_str!("../../../migrations/001_completion_ledger.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/002_aggregates.sql"))?;
        Ok(())
    }

    /// Lock the connection. Recovers from poisoning: the SQLite
    /// connection is still usable after a panic in another holder.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the connection, giving up after `timeout`.
    fn lock_within(&self, timeout: Duration) -> XpResult<MutexGuard<'_, Connection>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(XpError::StoreTimeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

fn table_for(kind: CategoryKind) -> (&'static str, &'static str) {
    match kind {
        CategoryKind::Pillar  => ("skill_xp", "pillar"),
        CategoryKind::Subject => ("subject_credit", "subject"),
    }
}
