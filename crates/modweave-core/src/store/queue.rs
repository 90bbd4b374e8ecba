//! Durable build queue over the `queue_items` table.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{parse_column, Store, StoreError, StoreWriter};
use crate::model::{millis_to_datetime, ItemStatus, Priority, QueueItem};

const ITEM_COLUMNS: &str = "id, file_id, envelope, priority, fingerprint, status, error, \
                            claimed_by, created_at, claimed_at, finished_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "item_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Inserted(i64),
    /// Same file version and envelope already queued or done.
    Duplicate(i64),
    /// A failed item for the same version went back to pending.
    Reset(i64),
}

impl EnqueueOutcome {
    pub fn item_id(&self) -> i64 {
        match self {
            EnqueueOutcome::Inserted(id)
            | EnqueueOutcome::Duplicate(id)
            | EnqueueOutcome::Reset(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub claimed: u64,
    pub complete: u64,
    pub error: u64,
}

impl Store {
    pub fn queue_item(&self, id: i64) -> Result<Option<QueueItem>, StoreError> {
        let conn = self.conn();
        let item = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1"),
                params![id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// The item for one (file version, envelope), if ever queued.
    pub fn queue_item_for(
        &self,
        file_id: i64,
        envelope: &str,
        fingerprint: &str,
    ) -> Result<Option<QueueItem>, StoreError> {
        let conn = self.conn();
        let item = conn
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM queue_items
                     WHERE file_id = ?1 AND envelope = ?2 AND fingerprint = ?3"
                ),
                params![file_id, envelope, fingerprint],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Items newest first, optionally filtered by status.
    pub fn queue_items(
        &self,
        status: Option<ItemStatus>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            item_from_row,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM queue_items GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_column::<ItemStatus>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = u64::try_from(n).unwrap_or(0);
            match status {
                ItemStatus::Pending => counts.pending = n,
                ItemStatus::Claimed => counts.claimed = n,
                ItemStatus::Complete => counts.complete = n,
                ItemStatus::Error => counts.error = n,
            }
        }
        Ok(counts)
    }
}

impl StoreWriter {
    /// Queue `envelope` for one file version. Unchanged versions are never
    /// queued twice; a failed one is reset to pending instead.
    pub fn enqueue(
        &self,
        file_id: i64,
        envelope: &str,
        priority: Priority,
        fingerprint: &str,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO queue_items (file_id, envelope, priority, fingerprint, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
             ON CONFLICT(file_id, envelope, fingerprint) DO NOTHING",
            params![
                file_id,
                envelope,
                priority.rank(),
                fingerprint,
                Utc::now().timestamp_millis()
            ],
        )?;
        if inserted > 0 {
            let id = tx.last_insert_rowid();
            tx.commit()?;
            debug!(item_id = id, file_id, envelope, ?priority, "enqueued");
            return Ok(EnqueueOutcome::Inserted(id));
        }

        let (id, status): (i64, ItemStatus) = tx.query_row(
            "SELECT id, status FROM queue_items
             WHERE file_id = ?1 AND envelope = ?2 AND fingerprint = ?3",
            params![file_id, envelope, fingerprint],
            |row| Ok((row.get(0)?, parse_column(row, 1)?)),
        )?;
        let outcome = if status == ItemStatus::Error {
            tx.execute(
                "UPDATE queue_items
                 SET status = 'pending', error = NULL, claimed_by = NULL, claimed_at = NULL,
                     finished_at = NULL, priority = MAX(priority, ?2)
                 WHERE id = ?1",
                params![id, priority.rank()],
            )?;
            EnqueueOutcome::Reset(id)
        } else {
            // A flash request still jumps the line for an item not yet taken.
            tx.execute(
                "UPDATE queue_items SET priority = MAX(priority, ?2)
                 WHERE id = ?1 AND status = 'pending'",
                params![id, priority.rank()],
            )?;
            EnqueueOutcome::Duplicate(id)
        };
        tx.commit()?;
        debug!(item_id = id, file_id, envelope, ?outcome, "enqueue matched existing item");
        Ok(outcome)
    }

    /// Claim the next item: highest priority first, then oldest. Items
    /// claimed at least `stale_after` ago count as unclaimed.
    pub fn claim_next(
        &self,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<Option<QueueItem>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let stale_before = now - i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        let conn = self.conn();
        let item = conn
            .query_row(
                &format!(
                    "UPDATE queue_items
                     SET status = 'claimed', claimed_by = ?1, claimed_at = ?2
                     WHERE id = (
                         SELECT id FROM queue_items
                         WHERE status = 'pending'
                            OR (status = 'claimed' AND claimed_at <= ?3)
                         ORDER BY priority DESC, id ASC
                         LIMIT 1
                     )
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![worker_id, now, stale_before],
                item_from_row,
            )
            .optional()?;
        if let Some(item) = &item {
            debug!(item_id = item.id, file_id = item.file_id, envelope = %item.envelope, "claimed");
        }
        Ok(item)
    }

    pub fn complete(&self, item_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE queue_items SET status = 'complete', error = NULL, finished_at = ?2
             WHERE id = ?1 AND status = 'claimed'",
            params![item_id, Utc::now().timestamp_millis()],
        )?;
        if updated == 0 {
            warn!(item_id, "complete called for an item that is not claimed");
        }
        Ok(())
    }

    /// Record a failure. The item stays in `error` until explicitly retried.
    /// Returns whether a claimed item was updated.
    pub fn fail(&self, item_id: i64, message: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE queue_items SET status = 'error', error = ?2, finished_at = ?3
             WHERE id = ?1 AND status = 'claimed'",
            params![item_id, message, Utc::now().timestamp_millis()],
        )?;
        if updated == 0 {
            warn!(item_id, error = message, "fail called for an item that is not claimed");
        } else {
            warn!(item_id, error = message, "queue item failed");
        }
        Ok(updated > 0)
    }

    /// Put a failed item back to pending. Returns whether it was in error.
    pub fn retry(&self, item_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE queue_items
             SET status = 'pending', error = NULL, claimed_by = NULL, claimed_at = NULL,
                 finished_at = NULL
             WHERE id = ?1 AND status = 'error'",
            params![item_id],
        )?;
        if updated > 0 {
            info!(item_id, "retrying queue item");
        }
        Ok(updated > 0)
    }

    /// Put a completed item back to pending, keeping its priority. Used when
    /// the work it did is no longer valid, e.g. after a parser version bump.
    pub fn reopen(&self, item_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE queue_items
             SET status = 'pending', claimed_by = NULL, claimed_at = NULL, finished_at = NULL
             WHERE id = ?1 AND status = 'complete'",
            params![item_id],
        )?;
        if updated > 0 {
            debug!(item_id, "reopened completed queue item");
        }
        Ok(updated > 0)
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        file_id: row.get(1)?,
        envelope: row.get(2)?,
        priority: Priority::from_rank(row.get(3)?),
        fingerprint: row.get(4)?,
        status: parse_column(row, 5)?,
        error: row.get(6)?,
        claimed_by: row.get(7)?,
        created_at: millis_to_datetime(row.get(8)?),
        claimed_at: row.get::<_, Option<i64>>(9)?.map(millis_to_datetime),
        finished_at: row.get::<_, Option<i64>>(10)?.map(millis_to_datetime),
    })
}
