//! Raw key chain and skipped-key rows.
//!
//! The ratchet logic lives in [`crate::keychain`]; this module only moves
//! bytes in and out of SQLite. Every `*_with` function takes the caller's
//! connection so a whole receive can commit or roll back as one unit.

use super::Database;
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use zeroize::Zeroizing;

/// Persisted ratchet state for one contact.
#[derive(Clone)]
pub struct KeyChainRecord {
    /// Owning contact.
    pub contact_id: i64,
    /// Root derived from the handshake secret.
    pub root_key: Zeroizing<Vec<u8>>,
    /// Current sending chain key.
    pub send_chain_key: Zeroizing<Vec<u8>>,
    /// Current receiving chain key.
    pub recv_chain_key: Zeroizing<Vec<u8>>,
    /// Next counter to send.
    pub send_counter: u64,
    /// Next counter expected.
    pub recv_counter: u64,
}

impl std::fmt::Debug for KeyChainRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyChainRecord")
            .field("contact_id", &self.contact_id)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish_non_exhaustive()
    }
}

fn to_sql_counter(counter: u64) -> Result<i64> {
    i64::try_from(counter).map_err(|_| Error::Protocol("counter overflow".into()))
}

fn from_sql_counter(counter: i64) -> Result<u64> {
    u64::try_from(counter).map_err(|_| Error::StorageCorrupt("negative counter".into()))
}

/// Key chain table access.
#[derive(Debug, Clone)]
pub struct KeyChainStore {
    db: Database,
}

impl KeyChainStore {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create the chain for a contact. Fails if one already exists.
    pub fn insert_with(conn: &Connection, record: &KeyChainRecord, at: i64) -> Result<()> {
        conn.execute(
            r#"INSERT INTO key_chains
               (contact_id, root_key, send_chain_key, recv_chain_key,
                send_counter, recv_counter, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                record.contact_id,
                record.root_key.as_slice(),
                record.send_chain_key.as_slice(),
                record.recv_chain_key.as_slice(),
                to_sql_counter(record.send_counter)?,
                to_sql_counter(record.recv_counter)?,
                at,
            ],
        )?;
        Ok(())
    }

    /// Load a contact's chain.
    pub fn load_with(conn: &Connection, contact_id: i64) -> Result<Option<KeyChainRecord>> {
        let row = conn
            .query_row(
                r#"SELECT root_key, send_chain_key, recv_chain_key, send_counter, recv_counter
                   FROM key_chains WHERE contact_id = ?"#,
                params![contact_id],
                |row| {
                    Ok((
                        Zeroizing::new(row.get::<_, Vec<u8>>(0)?),
                        Zeroizing::new(row.get::<_, Vec<u8>>(1)?),
                        Zeroizing::new(row.get::<_, Vec<u8>>(2)?),
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(root_key, send_chain_key, recv_chain_key, send, recv)| {
            Ok(KeyChainRecord {
                contact_id,
                root_key,
                send_chain_key,
                recv_chain_key,
                send_counter: from_sql_counter(send)?,
                recv_counter: from_sql_counter(recv)?,
            })
        })
        .transpose()
    }

    /// Load a contact's chain.
    pub fn load(&self, contact_id: i64) -> Result<Option<KeyChainRecord>> {
        self.db.with_conn(|conn| Self::load_with(conn, contact_id))
    }

    /// Persist advanced chain state.
    ///
    /// Refuses to move either counter backwards.
    pub fn advance_with(conn: &Connection, record: &KeyChainRecord, at: i64) -> Result<()> {
        let send = to_sql_counter(record.send_counter)?;
        let recv = to_sql_counter(record.recv_counter)?;
        let changed = conn.execute(
            r#"UPDATE key_chains
               SET send_chain_key = ?, recv_chain_key = ?, send_counter = ?, recv_counter = ?,
                   updated_at = ?
               WHERE contact_id = ? AND send_counter <= ? AND recv_counter <= ?"#,
            params![
                record.send_chain_key.as_slice(),
                record.recv_chain_key.as_slice(),
                send,
                recv,
                at,
                record.contact_id,
                send,
                recv,
            ],
        )?;
        if changed == 0 {
            return Err(Error::StorageCorrupt(format!(
                "key chain for contact {} missing or would regress",
                record.contact_id
            )));
        }
        Ok(())
    }

    /// Overwrite chain state unconditionally, counters included.
    #[cfg(any(debug_assertions, feature = "dangerous-debug"))]
    pub fn overwrite_with(conn: &Connection, record: &KeyChainRecord, at: i64) -> Result<()> {
        conn.execute(
            r#"UPDATE key_chains
               SET send_chain_key = ?, recv_chain_key = ?, send_counter = ?, recv_counter = ?,
                   updated_at = ?
               WHERE contact_id = ?"#,
            params![
                record.send_chain_key.as_slice(),
                record.recv_chain_key.as_slice(),
                to_sql_counter(record.send_counter)?,
                to_sql_counter(record.recv_counter)?,
                at,
                record.contact_id,
            ],
        )?;
        Ok(())
    }

    /// Cache a message key for an out-of-order counter.
    pub fn insert_skipped_with(
        conn: &Connection,
        contact_id: i64,
        counter: u64,
        message_key: &[u8],
        at: i64,
    ) -> Result<()> {
        conn.execute(
            r#"INSERT OR IGNORE INTO skipped_keys (contact_id, counter, message_key, created_at)
               VALUES (?, ?, ?, ?)"#,
            params![contact_id, to_sql_counter(counter)?, message_key, at],
        )?;
        Ok(())
    }

    /// Remove and return the cached key for `counter`, if any.
    pub fn take_skipped_with(
        conn: &Connection,
        contact_id: i64,
        counter: u64,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let counter = to_sql_counter(counter)?;
        let key: Option<Vec<u8>> = conn
            .query_row(
                "SELECT message_key FROM skipped_keys WHERE contact_id = ? AND counter = ?",
                params![contact_id, counter],
                |row| row.get(0),
            )
            .optional()?;
        if key.is_some() {
            conn.execute(
                "DELETE FROM skipped_keys WHERE contact_id = ? AND counter = ?",
                params![contact_id, counter],
            )?;
        }
        Ok(key.map(Zeroizing::new))
    }

    /// Drop every cached key for a contact.
    pub fn clear_skipped_with(conn: &Connection, contact_id: i64) -> Result<usize> {
        Ok(conn.execute("DELETE FROM skipped_keys WHERE contact_id = ?", params![contact_id])?)
    }

    /// Cached counters for a contact, ascending.
    pub fn skipped_counters(&self, contact_id: i64) -> Result<Vec<u64>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT counter FROM skipped_keys WHERE contact_id = ? ORDER BY counter ASC",
            )?;
            let rows = stmt
                .query_map(params![contact_id], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(from_sql_counter).collect()
        })
    }

    /// Delete cached keys created before `cutoff`.
    pub fn delete_skipped_before(&self, cutoff: i64) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM skipped_keys WHERE created_at < ?", params![cutoff])?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contact_support::new_contact;
    use crate::storage::ContactStore;

    fn record(contact_id: i64, send: u64, recv: u64) -> KeyChainRecord {
        KeyChainRecord {
            contact_id,
            root_key: Zeroizing::new(vec![1; 32]),
            send_chain_key: Zeroizing::new(vec![2; 32]),
            recv_chain_key: Zeroizing::new(vec![3; 32]),
            send_counter: send,
            recv_counter: recv,
        }
    }

    fn setup() -> (KeyChainStore, i64) {
        let db = Database::open_in_memory().expect("db");
        let contact_id = ContactStore::new(db.clone())
            .insert(&new_contact("bob"))
            .expect("contact");
        (KeyChainStore::new(db), contact_id)
    }

    #[test]
    fn test_advance_refuses_regression() {
        let (store, id) = setup();
        store
            .database()
            .with_conn(|c| KeyChainStore::insert_with(c, &record(id, 0, 0), 0))
            .expect("insert");
        store
            .database()
            .with_conn(|c| KeyChainStore::advance_with(c, &record(id, 3, 2), 1))
            .expect("advance");

        let result = store
            .database()
            .with_conn(|c| KeyChainStore::advance_with(c, &record(id, 2, 2), 2));
        assert!(matches!(result, Err(Error::StorageCorrupt(_))));

        let loaded = store.load(id).expect("load").expect("present");
        assert_eq!((loaded.send_counter, loaded.recv_counter), (3, 2));
    }

    #[test]
    fn test_skipped_taken_once() {
        let (store, id) = setup();
        store
            .database()
            .with_conn(|c| {
                KeyChainStore::insert_with(c, &record(id, 0, 0), 0)?;
                KeyChainStore::insert_skipped_with(c, id, 4, &[9; 32], 100)
            })
            .expect("setup");

        let first = store
            .database()
            .with_conn(|c| KeyChainStore::take_skipped_with(c, id, 4))
            .expect("take");
        assert_eq!(first.as_deref().map(Vec::as_slice), Some(&[9u8; 32][..]));

        let second = store
            .database()
            .with_conn(|c| KeyChainStore::take_skipped_with(c, id, 4))
            .expect("take again");
        assert!(second.is_none());
    }

    #[test]
    fn test_sweep_by_age() {
        let (store, id) = setup();
        store
            .database()
            .with_conn(|c| {
                KeyChainStore::insert_with(c, &record(id, 0, 0), 0)?;
                KeyChainStore::insert_skipped_with(c, id, 1, &[1; 32], 100)?;
                KeyChainStore::insert_skipped_with(c, id, 2, &[2; 32], 500)
            })
            .expect("setup");

        assert_eq!(store.delete_skipped_before(200).expect("sweep"), 1);
        assert_eq!(store.skipped_counters(id).expect("list"), vec![2]);
    }
}
