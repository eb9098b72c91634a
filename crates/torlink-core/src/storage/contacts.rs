//! Confirmed contacts.

use super::{now, Database};
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Friendship lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum FriendshipStatus {
    /// Keys exchanged, waiting for the peer's confirmation.
    Pending = 0,
    /// Both sides hold the session.
    Confirmed = 1,
}

impl TryFrom<i64> for FriendshipStatus {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Confirmed),
            other => Err(Error::StorageCorrupt(format!("friendship status {}", other))),
        }
    }
}

/// A peer with an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Row id; stable local identity of the peer.
    pub id: i64,
    /// Peer's chosen name.
    pub display_name: String,
    /// Ed25519 public key.
    pub signing_public_key: Vec<u8>,
    /// X25519 public key.
    pub x25519_public_key: Vec<u8>,
    /// ML-KEM public key, absent for legacy peers.
    pub kyber_public_key: Option<Vec<u8>>,
    /// Where to send pings and messages.
    pub messaging_address: String,
    /// Where to send call signalling.
    pub voice_address: String,
    /// Where to send handshake payloads.
    pub friend_request_address: String,
    /// User marked the contact as verified.
    pub trusted: bool,
    /// User blocked the contact.
    pub blocked: bool,
    /// Friendship lifecycle.
    pub status: FriendshipStatus,
    /// Creation time (Unix seconds).
    pub created_at: i64,
}

/// Fields for a new contact.
#[derive(Debug, Clone)]
pub struct NewContact {
    /// Peer's chosen name.
    pub display_name: String,
    /// Ed25519 public key.
    pub signing_public_key: Vec<u8>,
    /// X25519 public key.
    pub x25519_public_key: Vec<u8>,
    /// ML-KEM public key.
    pub kyber_public_key: Option<Vec<u8>>,
    /// Messaging address.
    pub messaging_address: String,
    /// Voice address.
    pub voice_address: String,
    /// Friend-request address.
    pub friend_request_address: String,
    /// Initial status.
    pub status: FriendshipStatus,
}

const COLUMNS: &str = "id, display_name, signing_public_key, x25519_public_key, kyber_public_key, \
    messaging_address, voice_address, friend_request_address, trusted, blocked, status, created_at";

fn read_row(row: &Row<'_>) -> rusqlite::Result<(Contact, i64)> {
    Ok((
        Contact {
            id: row.get(0)?,
            display_name: row.get(1)?,
            signing_public_key: row.get(2)?,
            x25519_public_key: row.get(3)?,
            kyber_public_key: row.get(4)?,
            messaging_address: row.get(5)?,
            voice_address: row.get(6)?,
            friend_request_address: row.get(7)?,
            trusted: row.get(8)?,
            blocked: row.get(9)?,
            status: FriendshipStatus::Pending,
            created_at: row.get(11)?,
        },
        row.get(10)?,
    ))
}

fn finish((mut contact, status): (Contact, i64)) -> Result<Contact> {
    contact.status = FriendshipStatus::try_from(status)?;
    Ok(contact)
}

/// Contact table access.
#[derive(Debug, Clone)]
pub struct ContactStore {
    db: Database,
}

impl ContactStore {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert inside an existing transaction.
    pub(crate) fn insert_with(conn: &Connection, contact: &NewContact) -> Result<i64> {
        let ts = now();
        conn.execute(
            r#"INSERT INTO contacts
               (display_name, signing_public_key, x25519_public_key, kyber_public_key,
                messaging_address, voice_address, friend_request_address, status,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                contact.display_name,
                contact.signing_public_key,
                contact.x25519_public_key,
                contact.kyber_public_key,
                contact.messaging_address,
                contact.voice_address,
                contact.friend_request_address,
                contact.status as i64,
                ts,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a contact and return its id.
    pub fn insert(&self, contact: &NewContact) -> Result<i64> {
        self.db.with_conn(|conn| Self::insert_with(conn, contact))
    }

    pub(crate) fn get_with(conn: &Connection, id: i64) -> Result<Option<Contact>> {
        conn.query_row(
            &format!("SELECT {} FROM contacts WHERE id = ?", COLUMNS),
            params![id],
            read_row,
        )
        .optional()?
        .map(finish)
        .transpose()
    }

    /// Fetch by id.
    pub fn get(&self, id: i64) -> Result<Option<Contact>> {
        self.db.with_conn(|conn| Self::get_with(conn, id))
    }

    /// Fetch by any of the peer's rendezvous addresses.
    pub fn get_by_address(&self, address: &str) -> Result<Option<Contact>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM contacts
                     WHERE messaging_address = ?1 OR friend_request_address = ?1
                     LIMIT 1",
                    COLUMNS
                ),
                params![address],
                read_row,
            )
            .optional()?
            .map(finish)
            .transpose()
        })
    }

    /// All contacts, oldest first.
    pub fn list(&self) -> Result<Vec<Contact>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM contacts ORDER BY id ASC", COLUMNS))?;
            let rows = stmt
                .query_map([], read_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(finish).collect()
        })
    }

    fn set_flag(&self, id: i64, column: &str, value: bool) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                &format!("UPDATE contacts SET {} = ?, updated_at = ? WHERE id = ?", column),
                params![value, now(), id],
            )?)
        })?;
        if changed == 0 {
            return Err(Error::NotFound(format!("contact {}", id)));
        }
        Ok(())
    }

    /// Toggle the trust flag.
    pub fn set_trusted(&self, id: i64, trusted: bool) -> Result<()> {
        self.set_flag(id, "trusted", trusted)
    }

    /// Toggle the block flag.
    pub fn set_blocked(&self, id: i64, blocked: bool) -> Result<()> {
        self.set_flag(id, "blocked", blocked)
    }

    /// Delete a contact and everything derived from it.
    ///
    /// Key chain, skipped keys, inbox entries and messages cascade; outbox
    /// items carry no foreign key and are removed explicitly.
    pub fn delete(&self, id: i64) -> Result<bool> {
        self.db.transaction(|tx| {
            tx.execute("DELETE FROM outbox WHERE contact_id = ?", params![id])?;
            Ok(tx.execute("DELETE FROM contacts WHERE id = ?", params![id])? > 0)
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::SigningKeypair;
    use crate::identity::test_support::random_onion;

    pub fn new_contact(name: &str) -> NewContact {
        NewContact {
            display_name: name.into(),
            signing_public_key: vec![1; 32],
            x25519_public_key: vec![2; 32],
            kyber_public_key: None,
            messaging_address: random_onion().to_string(),
            voice_address: random_onion().to_string(),
            friend_request_address: random_onion().to_string(),
            status: FriendshipStatus::Confirmed,
        }
    }

    /// A contact that signs with `keys`.
    pub fn keyed_contact(name: &str, keys: &SigningKeypair) -> NewContact {
        NewContact {
            signing_public_key: keys.public_key().to_vec(),
            ..new_contact(name)
        }
    }
}
