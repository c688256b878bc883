//! Store methods for the completion ledger.

use super::{CompletionLedger, XpStore};
use crate::{
    error::XpResult,
    event::{AppendOutcome, CompletionEvent, LedgerEntry, SubjectDistribution},
    types::{LedgerSeq, UserId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

/// Row as read from SQLite, before the distribution JSON is decoded.
struct RawEntry {
    seq:          LedgerSeq,
    recorded_at:  DateTime<Utc>,
    completion_id: String,
    user_id:      String,
    task_id:      String,
    quest_id:     String,
    pillar:       String,
    xp_value:     i64,
    distribution: Option<String>,
    completed_at: DateTime<Utc>,
}

const ENTRY_COLUMNS: &str =
    "seq, recorded_at, completion_id, user_id, task_id, quest_id,
     pillar, xp_value, subject_distribution, completed_at";

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq:           row.get(0)?,
            recorded_at:   row.get(1)?,
            completion_id: row.get(2)?,
            user_id:       row.get(3)?,
            task_id:       row.get(4)?,
            quest_id:      row.get(5)?,
            pillar:        row.get(6)?,
            xp_value:      row.get(7)?,
            distribution:  row.get(8)?,
            completed_at:  row.get(9)?,
        })
    }

    fn decode(self) -> XpResult<LedgerEntry> {
        let subject_distribution = match self.distribution {
            Some(json) => Some(serde_json::from_str::<SubjectDistribution>(&json)?),
            None => None,
        };
        Ok(LedgerEntry {
            seq: self.seq,
            recorded_at: self.recorded_at,
            event: CompletionEvent {
                id: self.completion_id,
                user_id: self.user_id,
                task_id: self.task_id,
                quest_id: self.quest_id,
                pillar: self.pillar,
                xp_value: self.xp_value,
                subject_distribution,
                completed_at: self.completed_at,
            },
        })
    }
}

impl XpStore {
    /// Seq of the entry that collides with `event`, if any.
    fn existing_seq(
        conn: &rusqlite::Connection,
        event: &CompletionEvent,
        pillar_key: &str,
    ) -> XpResult<Option<LedgerSeq>> {
        let seq = conn
            .query_row(
                "SELECT seq FROM completion_ledger
                 WHERE completion_id = ?1
                    OR (user_id = ?2 AND task_id = ?3 AND pillar_key = ?4)
                 ORDER BY seq ASC LIMIT 1",
                params![event.id, event.user_id, event.task_id, pillar_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq)
    }

    // ── Test / summary helpers ────────────────────────────────────────

    pub fn ledger_entry_count(&self) -> XpResult<i64> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM completion_ledger",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Σ xp_value over the ledger for one user, ignoring categories.
    pub fn ledger_xp_sum(&self, user_id: &str) -> XpResult<i64> {
        let total: i64 = self.lock().query_row(
            "SELECT COALESCE(SUM(xp_value), 0) FROM completion_ledger WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

impl CompletionLedger for XpStore {
    fn append(
        &self,
        event: &CompletionEvent,
        pillar_key: &str,
        recorded_at: DateTime<Utc>,
    ) -> XpResult<AppendOutcome> {
        let distribution = event
            .subject_distribution
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO completion_ledger
             (completion_id, user_id, task_id, quest_id, pillar, pillar_key,
              xp_value, subject_distribution, completed_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id,
                event.user_id,
                event.task_id,
                event.quest_id,
                event.pillar,
                pillar_key,
                event.xp_value,
                distribution,
                event.completed_at,
                recorded_at,
            ],
        )?;

        if inserted == 1 {
            return Ok(AppendOutcome::Appended {
                seq: conn.last_insert_rowid(),
            });
        }

        match Self::existing_seq(&conn, event, pillar_key)? {
            Some(seq) => Ok(AppendOutcome::Duplicate { seq }),
            // INSERT OR IGNORE also swallows CHECK failures; surface them.
            None => Err(crate::error::XpError::Validation {
                completion_id: event.id.clone(),
                reason: "ledger rejected the entry".into(),
            }),
        }
    }

    fn entries_for_user(&self, user_id: &str, after_seq: LedgerSeq) -> XpResult<Vec<LedgerEntry>> {
        let raw = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM completion_ledger
                 WHERE user_id = ?1 AND seq > ?2
                 ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map(params![user_id, after_seq], RawEntry::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raw.into_iter().map(RawEntry::decode).collect()
    }

    fn ledger_heads(&self) -> XpResult<Vec<(UserId, LedgerSeq)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, MAX(seq) FROM completion_ledger
             GROUP BY user_id ORDER BY user_id ASC",
        )?;
        let heads = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(heads)
    }

    fn entry(&self, seq: LedgerSeq) -> XpResult<Option<LedgerEntry>> {
        let raw = self
            .lock()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM completion_ledger WHERE seq = ?1"),
                params![seq],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::decode).transpose()
    }
}
