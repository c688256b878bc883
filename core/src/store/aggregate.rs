//! Store methods for the skill XP and subject credit tables.

use super::{
    table_for, AggregateRecord, AggregateStore, AggregateUpdate, CommitOutcome, WriteMode,
    XpStore, DEFAULT_BUSY_TIMEOUT,
};
use crate::{
    category::CategoryKind,
    error::{XpError, XpResult},
    types::{LedgerSeq, UserId},
};
use rusqlite::{params, Connection, TransactionBehavior};
use std::time::{Duration, Instant};

const WATERMARK_SQL: &str =
    "SELECT COALESCE(MAX(ledger_seq), 0) FROM (
         SELECT ledger_seq FROM skill_xp WHERE user_id = ?1
         UNION ALL
         SELECT ledger_seq FROM subject_credit WHERE user_id = ?1
     )";

fn watermark_on(conn: &Connection, user_id: &str) -> rusqlite::Result<LedgerSeq> {
    conn.query_row(WATERMARK_SQL, params![user_id], |row| row.get(0))
}

impl XpStore {
    /// Number of aggregate rows of `kind` across all users (for tests).
    pub fn aggregate_row_count(&self, kind: CategoryKind) -> XpResult<i64> {
        let (table, _) = table_for(kind);
        let count: i64 = self.lock().query_row(
            &format!("SELECT COUNT(*) FROM {table}"),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Single stored amount, or None when the row does not exist.
    pub fn stored_amount(
        &self,
        kind: CategoryKind,
        user_id: &str,
        category: &str,
    ) -> XpResult<Option<i64>> {
        use rusqlite::OptionalExtension;
        let (table, column) = table_for(kind);
        let amount = self
            .lock()
            .query_row(
                &format!("SELECT xp_amount FROM {table} WHERE user_id = ?1 AND {column} = ?2"),
                params![user_id, category],
                |row| row.get(0),
            )
            .optional()?;
        Ok(amount)
    }
}

impl AggregateStore for XpStore {
    fn records(&self, kind: CategoryKind, user_id: &str) -> XpResult<Vec<AggregateRecord>> {
        let (table, column) = table_for(kind);
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT user_id, {column}, xp_amount, ledger_seq, updated_at
             FROM {table} WHERE user_id = ?1
             ORDER BY {column} ASC"
        ))?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(AggregateRecord {
                    user_id:    row.get(0)?,
                    kind,
                    category:   row.get(1)?,
                    xp_amount:  row.get(2)?,
                    ledger_seq: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn watermark(&self, user_id: &str) -> XpResult<LedgerSeq> {
        Ok(watermark_on(&self.lock(), user_id)?)
    }

    fn watermarks(&self) -> XpResult<Vec<(UserId, LedgerSeq)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, MAX(ledger_seq) FROM (
                 SELECT user_id, ledger_seq FROM skill_xp
                 UNION ALL
                 SELECT user_id, ledger_seq FROM subject_credit
             )
             GROUP BY user_id ORDER BY user_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn commit(&self, update: &AggregateUpdate, timeout: Duration) -> XpResult<CommitOutcome> {
        let started = Instant::now();
        let mut conn = self.lock_within(timeout)?;

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(XpError::StoreTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        // The shortened busy timeout applies to this transaction only.
        conn.busy_timeout(remaining)?;
        let outcome = commit_on(&mut conn, update);
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        outcome
    }
}

fn commit_on(conn: &mut Connection, update: &AggregateUpdate) -> XpResult<CommitOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current_seq = watermark_on(&tx, &update.user_id)?;
    if current_seq != update.base_seq {
        // Dropping the transaction rolls it back.
        return Ok(CommitOutcome::Conflict { current_seq });
    }

    let amount_expr = match update.mode {
        WriteMode::Increment => "xp_amount + excluded.xp_amount",
        WriteMode::Overwrite => "excluded.xp_amount",
    };
    for write in &update.writes {
        let (table, column) = table_for(write.kind);
        tx.execute(
            &format!(
                "INSERT INTO {table} (user_id, {column}, xp_amount, ledger_seq, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (user_id, {column}) DO UPDATE SET
                     xp_amount  = {amount_expr},
                     ledger_seq = excluded.ledger_seq,
                     updated_at = excluded.updated_at"
            ),
            params![
                update.user_id,
                write.category,
                write.amount,
                update.through_seq,
                update.updated_at,
            ],
        )?;
    }

    tx.commit()?;
    Ok(CommitOutcome::Committed)
}
