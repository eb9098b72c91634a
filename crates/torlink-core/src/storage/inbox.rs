//! Ping inbox.
//!
//! One row per received ping until its plaintext is stored. The claim is a
//! single conditional UPDATE so that exactly one caller wins even across
//! processes sharing the file.

use super::Database;
use crate::error::{Error, Result};
use crate::protocol::ContentType;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Lifecycle of one inbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum PingState {
    /// Notification received; ciphertext not fetched.
    PingSeen = 0,
    /// Claimed for download.
    DownloadQueued = 1,
    /// Pong sent, waiting for the ciphertext.
    Downloading = 2,
    /// Plaintext persisted.
    MsgStored = 3,
    /// Fetch failed; eligible for retry after backoff.
    FailedTemp = 4,
    /// Waiting for the user to download it.
    ManualRequired = 5,
}

impl PingState {
    /// States a claim may start from.
    pub const CLAIMABLE: [PingState; 3] = [
        PingState::PingSeen,
        PingState::ManualRequired,
        PingState::FailedTemp,
    ];

    /// Whether the entry is still waiting for its plaintext.
    pub fn is_pending(self) -> bool {
        !matches!(self, PingState::MsgStored)
    }
}

impl TryFrom<i64> for PingState {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::PingSeen),
            1 => Ok(Self::DownloadQueued),
            2 => Ok(Self::Downloading),
            3 => Ok(Self::MsgStored),
            4 => Ok(Self::FailedTemp),
            5 => Ok(Self::ManualRequired),
            other => Err(Error::StorageCorrupt(format!("ping state {}", other))),
        }
    }
}

/// A received, not yet materialised ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingInboxEntry {
    /// Row id.
    pub id: i64,
    /// Owning contact.
    pub contact_id: i64,
    /// Sender-chosen ping id.
    pub ping_id: String,
    /// Current state.
    pub state: PingState,
    /// First wire byte of the ping.
    pub content_type: ContentType,
    /// Raw ping body.
    pub wire_bytes: Vec<u8>,
    /// Failed fetches so far.
    pub attempts: u32,
    /// When a FAILED_TEMP entry may be retried.
    pub next_retry_at: Option<i64>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

impl PingInboxEntry {
    /// Silent entries never surface in UI.
    pub fn is_silent(&self) -> bool {
        self.content_type.is_silent()
    }
}

type RawEntry = (i64, i64, String, i64, u8, Vec<u8>, u32, Option<i64>, i64, i64);

const COLUMNS: &str = "id, contact_id, ping_id, state, content_type, wire_bytes, attempts, \
    next_retry_at, created_at, updated_at";

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
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
    ))
}

fn finish(raw: RawEntry) -> Result<PingInboxEntry> {
    let (id, contact_id, ping_id, state, tag, wire_bytes, attempts, next_retry_at, created, updated) =
        raw;
    Ok(PingInboxEntry {
        id,
        contact_id,
        ping_id,
        state: PingState::try_from(state)?,
        content_type: ContentType::from_byte(tag)
            .map_err(|_| Error::StorageCorrupt(format!("content type {:#04x}", tag)))?,
        wire_bytes,
        attempts,
        next_retry_at,
        created_at: created,
        updated_at: updated,
    })
}

fn state_list(states: &[PingState]) -> String {
    states
        .iter()
        .map(|s| (*s as i64).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn query(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<PingInboxEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, read_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(finish).collect()
}

/// Inbox table access.
#[derive(Debug, Clone)]
pub struct InboxStore {
    db: Database,
}

impl InboxStore {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert a new entry unless the ping id is already known.
    ///
    /// Returns the entry id and whether it was newly inserted.
    pub fn insert(
        &self,
        contact_id: i64,
        ping_id: &str,
        content_type: ContentType,
        wire_bytes: &[u8],
        state: PingState,
        at: i64,
    ) -> Result<(i64, bool)> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                r#"INSERT OR IGNORE INTO ping_inbox
                   (contact_id, ping_id, state, content_type, wire_bytes, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    contact_id,
                    ping_id,
                    state as i64,
                    content_type as u8,
                    wire_bytes,
                    at,
                    at
                ],
            )? > 0;
            let id = conn.query_row(
                "SELECT id FROM ping_inbox WHERE ping_id = ?",
                params![ping_id],
                |row| row.get(0),
            )?;
            Ok((id, inserted))
        })
    }

    /// Fetch by id.
    pub fn get(&self, id: i64) -> Result<Option<PingInboxEntry>> {
        self.db.with_conn(|conn| Self::get_with(conn, id))
    }

    pub(crate) fn get_with(conn: &Connection, id: i64) -> Result<Option<PingInboxEntry>> {
        conn.query_row(
            &format!("SELECT {} FROM ping_inbox WHERE id = ?", COLUMNS),
            params![id],
            read_row,
        )
        .optional()?
        .map(finish)
        .transpose()
    }

    /// Fetch by ping id.
    pub fn get_by_ping(&self, ping_id: &str) -> Result<Option<PingInboxEntry>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM ping_inbox WHERE ping_id = ?", COLUMNS),
                params![ping_id],
                read_row,
            )
            .optional()?
            .map(finish)
            .transpose()
        })
    }

    /// Every entry for a contact, oldest first.
    pub fn list_for_contact(&self, contact_id: i64) -> Result<Vec<PingInboxEntry>> {
        self.db.with_conn(|conn| {
            query(
                conn,
                &format!(
                    "SELECT {} FROM ping_inbox WHERE contact_id = ? ORDER BY created_at ASC, id ASC",
                    COLUMNS
                ),
                params![contact_id],
            )
        })
    }

    /// Atomically move a claimable entry to DOWNLOAD_QUEUED.
    ///
    /// Returns false if the entry is gone or already claimed.
    pub fn claim(&self, id: i64, at: i64) -> Result<bool> {
        self.transition(id, &PingState::CLAIMABLE, PingState::DownloadQueued, at)
    }

    /// Conditional state change. Returns false if the entry was not in any
    /// of the `from` states.
    pub fn transition(&self, id: i64, from: &[PingState], to: PingState, at: i64) -> Result<bool> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE ping_inbox SET state = ?, updated_at = ? WHERE id = ? AND state IN ({})",
                    state_list(from)
                ),
                params![to as i64, at, id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Record a failed fetch. With a retry time the entry goes to
    /// FAILED_TEMP; without one it waits in MANUAL_REQUIRED for the user.
    pub fn mark_failed(&self, id: i64, next_retry_at: Option<i64>, at: i64) -> Result<bool> {
        let state = match next_retry_at {
            Some(_) => PingState::FailedTemp,
            None => PingState::ManualRequired,
        };
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                r#"UPDATE ping_inbox
                   SET state = ?, attempts = attempts + 1, next_retry_at = ?, updated_at = ?
                   WHERE id = ? AND state IN (?, ?)"#,
                params![
                    state as i64,
                    next_retry_at,
                    at,
                    id,
                    PingState::DownloadQueued as i64,
                    PingState::Downloading as i64,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// FAILED_TEMP entries whose backoff has elapsed.
    pub fn due_retries(&self, at: i64) -> Result<Vec<PingInboxEntry>> {
        self.db.with_conn(|conn| {
            query(
                conn,
                &format!(
                    "SELECT {} FROM ping_inbox WHERE state = ? AND next_retry_at <= ? ORDER BY id ASC",
                    COLUMNS
                ),
                params![PingState::FailedTemp as i64, at],
            )
        })
    }

    /// Entries left in flight by a previous process.
    pub fn in_flight(&self) -> Result<Vec<PingInboxEntry>> {
        self.db.with_conn(|conn| {
            query(
                conn,
                &format!(
                    "SELECT {} FROM ping_inbox WHERE state IN (?, ?) ORDER BY id ASC",
                    COLUMNS
                ),
                params![
                    PingState::DownloadQueued as i64,
                    PingState::Downloading as i64
                ],
            )
        })
    }

    pub(crate) fn set_stored_with(conn: &Connection, id: i64, at: i64) -> Result<bool> {
        Ok(conn.execute(
            "UPDATE ping_inbox SET state = ?, updated_at = ? WHERE id = ? AND state != ?",
            params![
                PingState::MsgStored as i64,
                at,
                id,
                PingState::MsgStored as i64
            ],
        )? > 0)
    }

    pub(crate) fn delete_with(conn: &Connection, id: i64) -> Result<bool> {
        Ok(conn.execute("DELETE FROM ping_inbox WHERE id = ?", params![id])? > 0)
    }

    /// Entries whose plaintext already exists in `messages`: marks them
    /// MSG_STORED and deletes them. Returns `(entry_id, contact_id)` pairs.
    pub fn reconcile_ghosts(&self, at: i64) -> Result<Vec<(i64, i64)>> {
        self.db.transaction(|tx| {
            let ghosts = {
                let mut stmt = tx.prepare(
                    r#"SELECT i.id, i.contact_id FROM ping_inbox i
                       JOIN messages m ON m.ping_id = i.ping_id
                       ORDER BY i.id ASC"#,
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<(i64, i64)>, _>>()?;
                rows
            };
            for (id, _) in &ghosts {
                Self::set_stored_with(tx, *id, at)?;
                Self::delete_with(tx, *id)?;
            }
            Ok(ghosts)
        })
    }

    /// Remove every entry for a contact.
    pub fn purge_contact(&self, contact_id: i64) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM ping_inbox WHERE contact_id = ?", params![contact_id])?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contact_support::new_contact;
    use crate::storage::ContactStore;

    fn setup() -> (InboxStore, i64) {
        let db = Database::open_in_memory().expect("db");
        let contact_id = ContactStore::new(db.clone())
            .insert(&new_contact("bob"))
            .expect("contact");
        (InboxStore::new(db), contact_id)
    }

    #[test]
    fn test_insert_dedupes_ping_id() {
        let (store, contact) = setup();
        let (a, new_a) = store
            .insert(contact, "p1", ContentType::Text, b"w", PingState::PingSeen, 1)
            .expect("first");
        let (b, new_b) = store
            .insert(contact, "p1", ContentType::Text, b"w", PingState::PingSeen, 2)
            .expect("second");
        assert_eq!(a, b);
        assert!(new_a);
        assert!(!new_b);
    }

    #[test]
    fn test_claim_once() {
        let (store, contact) = setup();
        let (id, _) = store
            .insert(contact, "p1", ContentType::Text, b"w", PingState::PingSeen, 1)
            .expect("insert");
        assert!(store.claim(id, 2).expect("first claim"));
        assert!(!store.claim(id, 3).expect("second claim"));
        assert_eq!(
            store.get(id).expect("get").map(|e| e.state),
            Some(PingState::DownloadQueued)
        );
    }

    #[test]
    fn test_failed_then_reclaimable() {
        let (store, contact) = setup();
        let (id, _) = store
            .insert(contact, "p1", ContentType::Text, b"w", PingState::PingSeen, 1)
            .expect("insert");
        store.claim(id, 2).expect("claim");
        assert!(store.mark_failed(id, Some(100), 3).expect("fail"));

        assert!(store.due_retries(50).expect("early").is_empty());
        assert_eq!(store.due_retries(100).expect("due").len(), 1);

        let entry = store.get(id).expect("get").expect("exists");
        assert_eq!(entry.attempts, 1);
        assert!(store.claim(id, 101).expect("reclaim"));
    }

    #[test]
    fn test_failed_without_retry_waits_for_user() {
        let (store, contact) = setup();
        let (id, _) = store
            .insert(contact, "p1", ContentType::Text, b"w", PingState::PingSeen, 1)
            .expect("insert");
        store.claim(id, 2).expect("claim");
        assert!(store.mark_failed(id, None, 3).expect("fail"));

        let entry = store.get(id).expect("get").expect("exists");
        assert_eq!(entry.state, PingState::ManualRequired);
        assert_eq!(entry.next_retry_at, None);
        assert!(store.due_retries(i64::MAX).expect("due").is_empty());
        assert!(store.claim(id, 4).expect("manual claim"));
    }

    #[test]
    fn test_reconcile_ghosts() {
        let (store, contact) = setup();
        let (ghost, _) = store
            .insert(contact, "p1", ContentType::Text, b"w", PingState::PingSeen, 1)
            .expect("ghost");
        let (live, _) = store
            .insert(contact, "p2", ContentType::Text, b"w", PingState::PingSeen, 1)
            .expect("live");
        store
            .database()
            .with_conn(|c| {
                c.execute(
                    "INSERT INTO messages (contact_id, ping_id, outgoing, content_type, body, created_at)
                     VALUES (?, 'p1', 0, 3, x'00', 0)",
                    params![contact],
                )?;
                Ok(())
            })
            .expect("message");

        assert_eq!(store.reconcile_ghosts(5).expect("reconcile"), vec![(ghost, contact)]);
        assert!(store.get(ghost).expect("get").is_none());
        assert!(store.get(live).expect("get").is_some());
    }

    #[test]
    fn test_purge_contact() {
        let (store, contact) = setup();
        store
            .insert(contact, "p1", ContentType::ProfileSync, b"w", PingState::PingSeen, 1)
            .expect("insert");
        assert_eq!(store.purge_contact(contact).expect("purge"), 1);
        assert!(store.list_for_contact(contact).expect("list").is_empty());
    }
}
