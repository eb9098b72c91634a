//! Plaintext messages.
//!
//! `ping_id` is unique, so materialising the same ping twice is a no-op.

use super::Database;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Row id.
    pub id: i64,
    /// Conversation.
    pub contact_id: i64,
    /// Ping id the message travelled under.
    pub ping_id: String,
    /// True if we sent it.
    pub outgoing: bool,
    /// Content tag byte.
    pub content_type: u8,
    /// Plaintext.
    pub body: Vec<u8>,
    /// Unix seconds.
    pub created_at: i64,
}

/// Fields for a new message.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    /// Conversation.
    pub contact_id: i64,
    /// Ping id.
    pub ping_id: &'a str,
    /// Direction.
    pub outgoing: bool,
    /// Content tag byte.
    pub content_type: u8,
    /// Plaintext.
    pub body: &'a [u8],
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        ping_id: row.get(2)?,
        outgoing: row.get(3)?,
        content_type: row.get(4)?,
        body: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Message table access.
#[derive(Debug, Clone)]
pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert unless a row for the ping already exists. Returns whether a
    /// row was written.
    pub fn insert_with(conn: &Connection, message: &NewMessage<'_>, at: i64) -> Result<bool> {
        let changed = conn.execute(
            r#"INSERT OR IGNORE INTO messages
               (contact_id, ping_id, outgoing, content_type, body, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
            params![
                message.contact_id,
                message.ping_id,
                message.outgoing,
                message.content_type,
                message.body,
                at,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Insert unless a row for the ping already exists.
    pub fn insert(&self, message: &NewMessage<'_>, at: i64) -> Result<bool> {
        self.db.with_conn(|conn| Self::insert_with(conn, message, at))
    }

    /// Fetch by ping id.
    pub fn get_by_ping(&self, ping_id: &str) -> Result<Option<StoredMessage>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    r#"SELECT id, contact_id, ping_id, outgoing, content_type, body, created_at
                       FROM messages WHERE ping_id = ?"#,
                    params![ping_id],
                    read_row,
                )
                .optional()?)
        })
    }

    /// A conversation, oldest first.
    pub fn list_for_contact(&self, contact_id: i64, limit: u32) -> Result<Vec<StoredMessage>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"SELECT id, contact_id, ping_id, outgoing, content_type, body, created_at
                   FROM messages WHERE contact_id = ?
                   ORDER BY created_at ASC, id ASC
                   LIMIT ?"#,
            )?;
            let rows = stmt
                .query_map(params![contact_id, limit], read_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
