//! Pending friend requests.
//!
//! At most one row per `(direction, peer_address)`: a new attempt
//! overwrites the old one in place and keeps its id.

use super::{now, Database};
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Which side started the handshake step this row tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum RequestDirection {
    /// We are sending a payload to the peer.
    Outgoing = 0,
    /// The peer sent us a payload.
    Incoming = 1,
}

impl TryFrom<i64> for RequestDirection {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Outgoing),
            1 => Ok(Self::Incoming),
            other => Err(Error::StorageCorrupt(format!("request direction {}", other))),
        }
    }
}

/// Request lifecycle.
///
/// `Sending -> Pending -> Accepted`, with `Failed` and `InvalidPin` as
/// terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum RequestStatus {
    /// Persisted, not yet handed to the transport.
    Sending = 0,
    /// Delivered (outgoing) or awaiting user action (incoming).
    Pending = 1,
    /// Gave up: stale, unreachable past the retry bound, or rejected.
    Failed = 2,
    /// The peer could not decrypt with the shared PIN.
    InvalidPin = 3,
    /// Handshake completed.
    Accepted = 4,
}

impl TryFrom<i64> for RequestStatus {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Sending),
            1 => Ok(Self::Pending),
            2 => Ok(Self::Failed),
            3 => Ok(Self::InvalidPin),
            4 => Ok(Self::Accepted),
            other => Err(Error::StorageCorrupt(format!("request status {}", other))),
        }
    }
}

/// An in-flight handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFriendRequest {
    /// Row id.
    pub id: i64,
    /// Direction.
    pub direction: RequestDirection,
    /// Lifecycle status.
    pub status: RequestStatus,
    /// Peer's friend-request address.
    pub peer_address: String,
    /// Opaque resume material (see the handshake module).
    pub payload: Vec<u8>,
    /// When the request last entered SENDING (Unix seconds). Staleness
    /// is measured from here; send attempts do not move it.
    pub sending_since: Option<i64>,
    /// First attempt (Unix seconds).
    pub created_at: i64,
    /// Last status change (Unix seconds).
    pub updated_at: i64,
}

type RawRequest = (i64, i64, i64, String, Vec<u8>, Option<i64>, i64, i64);

const COLUMNS: &str =
    "id, direction, status, peer_address, payload, sending_since, created_at, updated_at";

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish(raw: RawRequest) -> Result<PendingFriendRequest> {
    let (id, direction, status, peer_address, payload, sending_since, created_at, updated_at) = raw;
    Ok(PendingFriendRequest {
        id,
        direction: RequestDirection::try_from(direction)?,
        status: RequestStatus::try_from(status)?,
        peer_address,
        payload,
        sending_since,
        created_at,
        updated_at,
    })
}

fn sending_since(status: RequestStatus, at: i64) -> Option<i64> {
    (status == RequestStatus::Sending).then_some(at)
}

/// Request table access.
#[derive(Debug, Clone)]
pub struct RequestStore {
    db: Database,
}

impl RequestStore {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub(crate) fn upsert_with(
        conn: &Connection,
        direction: RequestDirection,
        peer_address: &str,
        status: RequestStatus,
        payload: &[u8],
    ) -> Result<i64> {
        let ts = now();
        conn.execute(
            r#"INSERT INTO pending_friend_requests
               (direction, status, peer_address, payload, sending_since, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
               ON CONFLICT(direction, peer_address) DO UPDATE SET
                   status = excluded.status,
                   payload = excluded.payload,
                   sending_since = excluded.sending_since,
                   created_at = excluded.created_at,
                   updated_at = excluded.updated_at"#,
            params![
                direction as i64,
                status as i64,
                peer_address,
                payload,
                sending_since(status, ts),
                ts
            ],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM pending_friend_requests WHERE direction = ? AND peer_address = ?",
            params![direction as i64, peer_address],
            |row| row.get(0),
        )?)
    }

    /// Insert or overwrite the request for `(direction, peer_address)`.
    pub fn upsert(
        &self,
        direction: RequestDirection,
        peer_address: &str,
        status: RequestStatus,
        payload: &[u8],
    ) -> Result<i64> {
        self.db
            .with_conn(|conn| Self::upsert_with(conn, direction, peer_address, status, payload))
    }

    /// Fetch by id.
    pub fn get(&self, id: i64) -> Result<Option<PendingFriendRequest>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM pending_friend_requests WHERE id = ?", COLUMNS),
                params![id],
                read_row,
            )
            .optional()?
            .map(finish)
            .transpose()
        })
    }

    /// Fetch the request for a direction and peer.
    pub fn find(
        &self,
        direction: RequestDirection,
        peer_address: &str,
    ) -> Result<Option<PendingFriendRequest>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM pending_friend_requests WHERE direction = ? AND peer_address = ?",
                    COLUMNS
                ),
                params![direction as i64, peer_address],
                read_row,
            )
            .optional()?
            .map(finish)
            .transpose()
        })
    }

    /// Load every request, first demoting rows that have been SENDING for
    /// longer than `stale_secs` to FAILED. Returns the rows and the demoted
    /// ids.
    pub fn load_all(&self, at: i64, stale_secs: i64) -> Result<(Vec<PendingFriendRequest>, Vec<i64>)> {
        self.db.transaction(|tx| {
            let cutoff = at - stale_secs;
            let demoted = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM pending_friend_requests WHERE status = ? AND sending_since < ?",
                )?;
                let ids = stmt
                    .query_map(params![RequestStatus::Sending as i64, cutoff], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?;
                ids
            };
            tx.execute(
                "UPDATE pending_friend_requests SET status = ?, sending_since = NULL, updated_at = ?
                 WHERE status = ? AND sending_since < ?",
                params![
                    RequestStatus::Failed as i64,
                    at,
                    RequestStatus::Sending as i64,
                    cutoff
                ],
            )?;

            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM pending_friend_requests ORDER BY id ASC",
                COLUMNS
            ))?;
            let rows = stmt
                .query_map([], read_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let requests = rows.into_iter().map(finish).collect::<Result<Vec<_>>>()?;
            Ok((requests, demoted))
        })
    }

    /// Move a request to `to` only if it is currently in `from`.
    ///
    /// Moving to SENDING restarts the staleness clock. Returns false when
    /// another path already moved it.
    pub fn transition(&self, id: i64, from: &[RequestStatus], to: RequestStatus) -> Result<bool> {
        self.db.with_conn(|conn| Self::transition_with(conn, id, from, to))
    }

    pub(crate) fn transition_with(
        conn: &Connection,
        id: i64,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<bool> {
        let allowed = from
            .iter()
            .map(|s| (*s as i64).to_string())
            .collect::<Vec<_>>()
            .join(",");
        let ts = now();
        let changed = conn.execute(
            &format!(
                "UPDATE pending_friend_requests SET status = ?, sending_since = ?, updated_at = ?
                 WHERE id = ? AND status IN ({})",
                allowed
            ),
            params![to as i64, sending_since(to, ts), ts, id],
        )?;
        Ok(changed > 0)
    }

    pub(crate) fn delete_with(conn: &Connection, id: i64) -> Result<bool> {
        Ok(conn.execute("DELETE FROM pending_friend_requests WHERE id = ?", params![id])? > 0)
    }

    /// Remove a request. Returns false if it was already gone.
    pub fn delete(&self, id: i64) -> Result<bool> {
        self.db.with_conn(|conn| Self::delete_with(conn, id))
    }
}
