use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{MirrorOp, OutboxEntry, now_timestamp};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS outbox (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    enqueued_at TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    next_attempt_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox(entity, entity_id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Key/value blobs ---

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.set_values(&[(key, value)])
    }

    /// Write several keys in one transaction: either all land or none do.
    pub fn set_values(&self, entries: &[(&str, &str)]) -> Result<()> {
        let now = now_timestamp();
        let tx = self.conn.unchecked_transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO kv_store (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- Outbox ---

    /// Queue a mirror operation. Older pending operations for the same
    /// entity are superseded and removed.
    pub fn enqueue_op(&self, op: &MirrorOp) -> Result<i64> {
        let payload = serde_json::to_string(op).context("Failed to serialize outbox op")?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM outbox WHERE entity = ?1 AND entity_id = ?2",
            params![op.entity(), op.entity_id()],
        )?;
        tx.execute(
            "INSERT INTO outbox (entity, entity_id, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![op.entity(), op.entity_id(), payload, now_timestamp()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    fn outbox_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<(OutboxEntry, String)> {
        let payload: String = row.get(1)?;
        Ok((
            OutboxEntry {
                id: row.get(0)?,
                // Placeholder until the payload is decoded by the caller.
                op: MirrorOp::DeleteTransaction { id: String::new() },
                enqueued_at: row.get(2)?,
                attempts: row.get(3)?,
                last_error: row.get(4)?,
                next_attempt_at: row.get(5)?,
            },
            payload,
        ))
    }

    /// Decode payloads, deleting rows that no longer decode so they do not
    /// linger in the pending count.
    fn decode_outbox_rows(&self, rows: Vec<(OutboxEntry, String)>) -> Result<Vec<OutboxEntry>> {
        let mut entries = Vec::with_capacity(rows.len());
        for (mut entry, payload) in rows {
            match serde_json::from_str(&payload) {
                Ok(op) => {
                    entry.op = op;
                    entries.push(entry);
                }
                Err(e) => {
                    tracing::warn!(outbox_id = entry.id, "discarding undecodable outbox op: {e}");
                    self.complete_op(entry.id)?;
                }
            }
        }
        Ok(entries)
    }

    /// All pending operations in enqueue order.
    pub fn list_outbox(&self) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, enqueued_at, attempts, last_error, next_attempt_at
             FROM outbox ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], Self::outbox_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        self.decode_outbox_rows(rows)
    }

    /// Pending operations whose backoff has elapsed at `now`.
    pub fn due_outbox(&self, now: &str) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, enqueued_at, attempts, last_error, next_attempt_at
             FROM outbox
             WHERE next_attempt_at IS NULL OR next_attempt_at <= ?1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![now], Self::outbox_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        self.decode_outbox_rows(rows)
    }

    pub fn complete_op(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn record_op_failure(&self, id: i64, error: &str, next_attempt_at: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?1, next_attempt_at = ?2
             WHERE id = ?3",
            params![error, next_attempt_at, id],
        )?;
        Ok(())
    }

    pub fn outbox_len(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Most recent failure message recorded against a pending op.
    pub fn last_outbox_error(&self) -> Result<Option<String>> {
        let error = self
            .conn
            .query_row(
                "SELECT last_error FROM outbox WHERE last_error IS NOT NULL
                 ORDER BY next_attempt_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(error)
    }

    pub fn clear_outbox(&self) -> Result<usize> {
        let rows = self.conn.execute("DELETE FROM outbox", [])?;
        Ok(rows)
    }

    /// Highest op id queued so far, or 0 when the outbox is empty.
    pub fn outbox_high_water(&self) -> Result<i64> {
        let id = self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM outbox", [], |row| {
                row.get(0)
            })?;
        Ok(id)
    }

    /// Drop ops queued at or before `id`, keeping anything enqueued later.
    pub fn clear_outbox_through(&self, id: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM outbox WHERE id <= ?1", params![id])?;
        Ok(rows)
    }
}
