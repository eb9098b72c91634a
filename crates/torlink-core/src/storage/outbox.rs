//! Persisted outbound frames.
//!
//! Everything the engine sends goes through here first. Items are keyed
//! by a dedupe key (`fr:<request>`, `ping:<id>`, `msg:<id>`, ...) so that
//! re-queueing the same logical send overwrites rather than duplicates.
//!
//! ## Features
//!
//! - Exponential backoff between attempts
//! - Bounded attempts, then FAILED for explicit resend
//! - HELD items wait for a peer signal before they become due

use super::Database;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// What an outbox item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum OutboxKind {
    /// Phase-1 or Phase-2 handshake blob.
    Handshake = 0,
    /// Ping announcing a message.
    Ping = 1,
    /// Pong requesting a message.
    Pong = 2,
    /// Encrypted message.
    Message = 3,
    /// Acknowledgement or handshake confirmation.
    Ack = 4,
}

impl TryFrom<i64> for OutboxKind {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            3 => Ok(Self::Message),
            4 => Ok(Self::Ack),
            other => Err(Error::StorageCorrupt(format!("outbox kind {}", other))),
        }
    }
}

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum OutboxStatus {
    /// Waiting for its next attempt.
    Pending = 0,
    /// Attempt in progress.
    Sending = 1,
    /// Handed to the peer.
    Delivered = 2,
    /// Gave up.
    Failed = 3,
    /// Waiting for a peer signal (a message waits for its pong).
    Held = 4,
}

impl OutboxStatus {
    /// Still on its way: pending, in flight or held.
    pub fn is_undelivered(self) -> bool {
        matches!(self, Self::Pending | Self::Sending | Self::Held)
    }
}

impl TryFrom<i64> for OutboxStatus {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Sending),
            2 => Ok(Self::Delivered),
            3 => Ok(Self::Failed),
            4 => Ok(Self::Held),
            other => Err(Error::StorageCorrupt(format!("outbox status {}", other))),
        }
    }
}

/// A queued frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxItem {
    /// Row id.
    pub id: i64,
    /// Kind.
    pub kind: OutboxKind,
    /// Logical identity of the send.
    pub dedupe_key: String,
    /// Destination onion address.
    pub address: String,
    /// Destination virtual port.
    pub port: u16,
    /// Encoded frame.
    pub frame: Vec<u8>,
    /// Friend request this item belongs to.
    pub request_id: Option<i64>,
    /// Contact this item belongs to.
    pub contact_id: Option<i64>,
    /// Status.
    pub status: OutboxStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Earliest next attempt (Unix seconds).
    pub next_retry_at: i64,
    /// Unix seconds.
    pub created_at: i64,
}

/// Fields for a new item.
#[derive(Debug, Clone)]
pub struct NewOutboxItem {
    /// Kind.
    pub kind: OutboxKind,
    /// Logical identity of the send.
    pub dedupe_key: String,
    /// Destination onion address.
    pub address: String,
    /// Destination virtual port.
    pub port: u16,
    /// Encoded frame.
    pub frame: Vec<u8>,
    /// Owning friend request.
    pub request_id: Option<i64>,
    /// Owning contact.
    pub contact_id: Option<i64>,
    /// Start HELD instead of PENDING.
    pub held: bool,
}

type RawItem = (
    i64,
    i64,
    String,
    String,
    u16,
    Vec<u8>,
    Option<i64>,
    Option<i64>,
    i64,
    u32,
    i64,
    i64,
);

const COLUMNS: &str = "id, kind, dedupe_key, address, port, frame, request_id, contact_id, \
    status, attempts, next_retry_at, created_at";

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn finish(raw: RawItem) -> Result<OutboxItem> {
    let (id, kind, key, address, port, frame, request_id, contact_id, status, attempts, next, created) =
        raw;
    Ok(OutboxItem {
        id,
        kind: OutboxKind::try_from(kind)?,
        dedupe_key: key,
        address,
        port,
        frame,
        request_id,
        contact_id,
        status: OutboxStatus::try_from(status)?,
        attempts,
        next_retry_at: next,
        created_at: created,
    })
}

/// The outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    db: Database,
}

impl Outbox {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queue inside an existing transaction. An item with the same dedupe
    /// key is overwritten and its attempt count reset.
    pub fn enqueue_with(conn: &Connection, item: &NewOutboxItem, at: i64) -> Result<i64> {
        let status = if item.held {
            OutboxStatus::Held
        } else {
            OutboxStatus::Pending
        };
        conn.execute(
            r#"INSERT INTO outbox
               (kind, dedupe_key, address, port, frame, request_id, contact_id, status,
                attempts, next_retry_at, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9, ?9)
               ON CONFLICT(dedupe_key) DO UPDATE SET
                   kind = excluded.kind,
                   address = excluded.address,
                   port = excluded.port,
                   frame = excluded.frame,
                   request_id = excluded.request_id,
                   contact_id = excluded.contact_id,
                   status = excluded.status,
                   attempts = 0,
                   next_retry_at = excluded.next_retry_at,
                   updated_at = excluded.updated_at"#,
            params![
                item.kind as i64,
                item.dedupe_key,
                item.address,
                item.port,
                item.frame,
                item.request_id,
                item.contact_id,
                status as i64,
                at,
            ],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM outbox WHERE dedupe_key = ?",
            params![item.dedupe_key],
            |row| row.get(0),
        )?)
    }

    /// Queue an item.
    pub fn enqueue(&self, item: &NewOutboxItem, at: i64) -> Result<i64> {
        self.db.with_conn(|conn| Self::enqueue_with(conn, item, at))
    }

    /// Fetch by id.
    pub fn get(&self, id: i64) -> Result<Option<OutboxItem>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM outbox WHERE id = ?", COLUMNS),
                params![id],
                read_row,
            )
            .optional()?
            .map(finish)
            .transpose()
        })
    }

    /// Fetch by dedupe key.
    pub fn get_by_key(&self, dedupe_key: &str) -> Result<Option<OutboxItem>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM outbox WHERE dedupe_key = ?", COLUMNS),
                params![dedupe_key],
                read_row,
            )
            .optional()?
            .map(finish)
            .transpose()
        })
    }

    /// PENDING items whose next attempt is due, oldest first.
    pub fn due(&self, at: i64, limit: usize) -> Result<Vec<OutboxItem>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM outbox WHERE status = ? AND next_retry_at <= ?
                 ORDER BY next_retry_at ASC, id ASC LIMIT ?",
                COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![OutboxStatus::Pending as i64, at, limit as i64],
                    read_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(finish).collect()
        })
    }

    /// Claim a PENDING item for an attempt. Returns false if another
    /// sender got there first.
    pub fn mark_sending(&self, id: i64, at: i64) -> Result<bool> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE outbox SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
                params![
                    OutboxStatus::Sending as i64,
                    at,
                    id,
                    OutboxStatus::Pending as i64
                ],
            )? > 0)
        })
    }

    /// Mark an item delivered.
    pub fn mark_delivered(&self, id: i64, at: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = ?, updated_at = ? WHERE id = ?",
                params![OutboxStatus::Delivered as i64, at, id],
            )?;
            Ok(())
        })
    }

    /// Mark the item with this key delivered, whatever its status. Used
    /// when the peer acknowledges something we may still be resending.
    pub fn mark_delivered_by_key(&self, dedupe_key: &str, at: i64) -> Result<bool> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE outbox SET status = ?, updated_at = ? WHERE dedupe_key = ? AND status != ?",
                params![
                    OutboxStatus::Delivered as i64,
                    at,
                    dedupe_key,
                    OutboxStatus::Delivered as i64
                ],
            )? > 0)
        })
    }

    /// Schedule another attempt with exponential backoff, or mark FAILED
    /// once `max_attempts` is reached. Returns the resulting status.
    pub fn mark_retry(&self, id: i64, retry: &RetryConfig, at: i64) -> Result<OutboxStatus> {
        self.db.transaction(|tx| {
            let attempts: Option<u32> = tx
                .query_row("SELECT attempts FROM outbox WHERE id = ?", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            let attempts = attempts.ok_or_else(|| Error::NotFound(format!("outbox {}", id)))?;

            if attempts + 1 >= retry.max_attempts {
                tx.execute(
                    "UPDATE outbox SET status = ?, attempts = attempts + 1, updated_at = ? WHERE id = ?",
                    params![OutboxStatus::Failed as i64, at, id],
                )?;
                return Ok(OutboxStatus::Failed);
            }

            let delay = retry.backoff_secs(attempts);
            tx.execute(
                r#"UPDATE outbox
                   SET status = ?, attempts = attempts + 1, next_retry_at = ?, updated_at = ?
                   WHERE id = ?"#,
                params![OutboxStatus::Pending as i64, at + delay, at, id],
            )?;
            Ok(OutboxStatus::Pending)
        })
    }

    /// Mark an item permanently failed.
    pub fn mark_failed(&self, id: i64, at: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = ?, updated_at = ? WHERE id = ?",
                params![OutboxStatus::Failed as i64, at, id],
            )?;
            Ok(())
        })
    }

    /// Fail every undelivered item belonging to a request.
    pub fn fail_for_request_with(conn: &Connection, request_id: i64, at: i64) -> Result<usize> {
        Ok(conn.execute(
            "UPDATE outbox SET status = ?, updated_at = ? WHERE request_id = ? AND status IN (?, ?, ?)",
            params![
                OutboxStatus::Failed as i64,
                at,
                request_id,
                OutboxStatus::Pending as i64,
                OutboxStatus::Sending as i64,
                OutboxStatus::Held as i64,
            ],
        )?)
    }

    /// Fail every undelivered item belonging to a request.
    pub fn fail_for_request(&self, request_id: i64, at: i64) -> Result<usize> {
        self.db
            .with_conn(|conn| Self::fail_for_request_with(conn, request_id, at))
    }

    /// Make a HELD item due now. Returns false if it was not held.
    pub fn release(&self, dedupe_key: &str, at: i64) -> Result<bool> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE outbox SET status = ?, next_retry_at = ?, updated_at = ?
                 WHERE dedupe_key = ? AND status = ?",
                params![
                    OutboxStatus::Pending as i64,
                    at,
                    at,
                    dedupe_key,
                    OutboxStatus::Held as i64
                ],
            )? > 0)
        })
    }

    /// Return items stuck in SENDING (a previous process died mid-send)
    /// to PENDING.
    pub fn reset_in_flight(&self, at: i64) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE outbox SET status = ?, next_retry_at = ?, updated_at = ? WHERE status = ?",
                params![
                    OutboxStatus::Pending as i64,
                    at,
                    at,
                    OutboxStatus::Sending as i64
                ],
            )?)
        })
    }

    /// Delete delivered items last touched before `cutoff`.
    pub fn cleanup(&self, cutoff: i64) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM outbox WHERE status = ? AND updated_at < ?",
                params![OutboxStatus::Delivered as i64, cutoff],
            )?)
        })
    }
}
