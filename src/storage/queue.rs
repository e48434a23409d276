//! Durable outbound mutation queue
//!
//! Entries are kept in SQLite so they survive a restart: the queue is the
//! only record of work not yet confirmed by the remote. `list_pending`
//! returns entries oldest first; FIFO is the fairness contract.

use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::database::Database;
use crate::error::EngineResult;
use crate::model::{now_millis, DeadLetter, FieldPatch, NewMutation, QueueEntry, QueueStatus};

/// Queue statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries waiting for a pass
    pub pending: usize,
    /// Entries claimed by the pass currently running
    pub syncing: usize,
    /// Total size in bytes of queued payloads
    pub bytes: usize,
}

#[derive(Clone)]
pub struct MutationQueue {
    db: Arc<Database>,
}

const ENTRY_COLUMNS: &str =
    "seq, id, owner_id, kind, target_id, payload, status, created_at, retry_count";

impl MutationQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Queue a mutation created now
    pub fn enqueue(&self, mutation: NewMutation) -> EngineResult<QueueEntry> {
        self.enqueue_at(mutation, now_millis())
    }

    /// Queue a mutation with an explicit creation time
    pub fn enqueue_at(&self, mutation: NewMutation, created_at: i64) -> EngineResult<QueueEntry> {
        let id = mutation
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let payload = mutation
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO pending_mutations (id, owner_id, kind, target_id, payload, status, created_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0)",
            params![
                id,
                mutation.owner_collection_id,
                mutation.kind.as_str(),
                mutation.target_entity_id,
                payload,
                created_at
            ],
        )?;
        let seq = conn.last_insert_rowid();

        tracing::debug!(
            "Queued {} of {} as {}",
            mutation.kind,
            mutation.target_entity_id,
            id
        );

        Ok(QueueEntry {
            id,
            kind: mutation.kind,
            owner_collection_id: mutation.owner_collection_id,
            target_entity_id: mutation.target_entity_id,
            payload: mutation.payload,
            status: QueueStatus::Pending,
            created_at,
            retry_count: 0,
            seq,
        })
    }

    /// Pending entries ordered by creation time, oldest first
    pub fn list_pending(&self) -> EngineResult<Vec<QueueEntry>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_mutations
             WHERE status = 'pending'
             ORDER BY created_at ASC, seq ASC",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map([], read_entry)?;
        skip_unreadable(rows, "queued mutation")
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<QueueEntry>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_mutations WHERE id = ?1",
            ENTRY_COLUMNS
        ))?;
        let entry = stmt.query_row(params![id], read_entry).optional()?;
        Ok(entry)
    }

    pub fn mark_syncing(&self, id: &str) -> EngineResult<()> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE pending_mutations SET status = 'syncing' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Release a claimed entry without counting an attempt
    pub fn mark_pending(&self, id: &str) -> EngineResult<()> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE pending_mutations SET status = 'pending' WHERE id = ?1 AND status = 'syncing'",
            params![id],
        )?;
        Ok(())
    }

    /// Hand a failed entry back for a later pass
    pub fn mark_pending_with_incremented_retry(&self, id: &str) -> EngineResult<()> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE pending_mutations SET status = 'pending', retry_count = retry_count + 1
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> EngineResult<()> {
        let conn = self.db.connection()?;
        conn.execute("DELETE FROM pending_mutations WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Remove an entry and keep a copy of it in the dead-letter log
    pub fn move_to_dead_letters(&self, entry: &QueueEntry, last_error: &str) -> EngineResult<()> {
        let payload = entry
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.db.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO dead_letters
             (id, owner_id, kind, target_id, payload, created_at, retry_count, dropped_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.owner_collection_id,
                entry.kind.as_str(),
                entry.target_entity_id,
                payload,
                entry.created_at,
                entry.retry_count + 1,
                now_millis(),
                last_error
            ],
        )?;
        tx.execute(
            "DELETE FROM pending_mutations WHERE id = ?1",
            params![entry.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn dead_letters(&self) -> EngineResult<Vec<DeadLetter>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, id, owner_id, kind, target_id, payload, 'pending', created_at, retry_count,
                    dropped_at, last_error
             FROM dead_letters
             ORDER BY dropped_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeadLetter {
                entry: read_entry(row)?,
                dropped_at: row.get(9)?,
                last_error: row.get(10)?,
            })
        })?;
        let letters = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(letters)
    }

    pub fn clear_dead_letters(&self) -> EngineResult<usize> {
        let conn = self.db.connection()?;
        let removed = conn.execute("DELETE FROM dead_letters", [])?;
        Ok(removed)
    }

    pub fn stats(&self) -> EngineResult<QueueStats> {
        let conn = self.db.connection()?;
        conn.query_row(
            "SELECT
                 COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'syncing' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(LENGTH(payload)), 0)
             FROM pending_mutations",
            [],
            |row| {
                let pending: i64 = row.get(0)?;
                let syncing: i64 = row.get(1)?;
                let bytes: i64 = row.get(2)?;
                Ok(QueueStats {
                    pending: pending as usize,
                    syncing: syncing as usize,
                    bytes: bytes as usize,
                })
            },
        )
        .map_err(Into::into)
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue").field("db", &self.db).finish()
    }
}

/// Collect rows, leaving out the ones whose stored columns cannot be decoded
///
/// Such rows stay in the table (and in `stats`) instead of being applied with
/// a lost payload.
pub(crate) fn skip_unreadable<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> EngineResult<Vec<T>> {
    let mut items = Vec::new();
    for row in rows {
        match row {
            Ok(item) => items.push(item),
            Err(e @ rusqlite::Error::FromSqlConversionFailure(..)) => {
                tracing::warn!("Skipping unreadable {}: {}", what, e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(items)
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let kind: String = row.get(3)?;
    let status: String = row.get(6)?;
    let payload: Option<String> = row.get(5)?;
    let retry_count: i64 = row.get(8)?;

    let kind = kind.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let status = status.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
    })?;
    let payload: Option<FieldPatch> = payload
        .map(|p| serde_json::from_str(&p))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(QueueEntry {
        seq: row.get(0)?,
        id: row.get(1)?,
        owner_collection_id: row.get(2)?,
        kind,
        target_entity_id: row.get(4)?,
        payload,
        status,
        created_at: row.get(7)?,
        retry_count: retry_count as u32,
    })
}
