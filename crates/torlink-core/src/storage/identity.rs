//! Local identity persistence. One row, id = 1.

use super::{now, Database};
use crate::crypto::{MlKemKeypair, SigningKeypair, StaticKeypair, X25519_KEY_SIZE};
use crate::error::{Error, Result};
use crate::identity::{IdentityAddresses, LocalIdentity, OnionAddress};
use rusqlite::{params, OptionalExtension};
use zeroize::Zeroizing;

/// Identity table access.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    db: Database,
}

struct RawIdentity {
    display_name: String,
    signing_secret: Zeroizing<Vec<u8>>,
    x25519_secret: Zeroizing<Vec<u8>>,
    mlkem_public: Vec<u8>,
    mlkem_secret: Zeroizing<Vec<u8>>,
    messaging: String,
    voice: String,
    friend_request: String,
    backup_reference: Option<String>,
    pin: String,
}

impl IdentityStore {
    /// Wrap a database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store the identity, replacing any previous one.
    pub fn save(&self, identity: &LocalIdentity) -> Result<()> {
        let signing = identity.signing().secret_bytes();
        let x25519 = identity.x25519().secret_bytes();
        self.db.with_conn(|conn| {
            conn.execute(
                r#"INSERT OR REPLACE INTO local_identity
                   (id, display_name, signing_secret, x25519_secret, mlkem_public, mlkem_secret,
                    messaging_address, voice_address, friend_request_address, backup_reference,
                    pin, created_at)
                   VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    identity.display_name,
                    signing.as_slice(),
                    x25519.as_slice(),
                    identity.mlkem().public_bytes(),
                    identity.mlkem().secret_bytes(),
                    identity.addresses.messaging.as_str(),
                    identity.addresses.voice.as_str(),
                    identity.addresses.friend_request.as_str(),
                    identity.backup_reference,
                    identity.pin(),
                    now(),
                ],
            )
            .map_err(|e| Error::Storage(format!("failed to store identity: {}", e)))?;
            Ok(())
        })
    }

    /// Whether an identity has been created.
    pub fn exists(&self) -> Result<bool> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT 1 FROM local_identity WHERE id = 1", [], |_| Ok(()))
                .optional()?
                .is_some())
        })
    }

    /// Load the identity, if one exists.
    pub fn load(&self) -> Result<Option<LocalIdentity>> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    r#"SELECT display_name, signing_secret, x25519_secret, mlkem_public,
                              mlkem_secret, messaging_address, voice_address,
                              friend_request_address, backup_reference, pin
                       FROM local_identity WHERE id = 1"#,
                    [],
                    |row| {
                        Ok(RawIdentity {
                            display_name: row.get(0)?,
                            signing_secret: Zeroizing::new(row.get(1)?),
                            x25519_secret: Zeroizing::new(row.get(2)?),
                            mlkem_public: row.get(3)?,
                            mlkem_secret: Zeroizing::new(row.get(4)?),
                            messaging: row.get(5)?,
                            voice: row.get(6)?,
                            friend_request: row.get(7)?,
                            backup_reference: row.get(8)?,
                            pin: row.get(9)?,
                        })
                    },
                )
                .optional()?)
        })?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let x25519: [u8; X25519_KEY_SIZE] = raw
            .x25519_secret
            .as_slice()
            .try_into()
            .map_err(|_| Error::StorageCorrupt("x25519 secret length".into()))?;
        let addresses = IdentityAddresses {
            messaging: OnionAddress::parse(&raw.messaging)
                .map_err(|_| Error::StorageCorrupt("messaging address".into()))?,
            voice: OnionAddress::parse(&raw.voice)
                .map_err(|_| Error::StorageCorrupt("voice address".into()))?,
            friend_request: OnionAddress::parse(&raw.friend_request)
                .map_err(|_| Error::StorageCorrupt("friend-request address".into()))?,
        };

        Ok(Some(LocalIdentity::from_parts(
            raw.display_name,
            addresses,
            raw.backup_reference,
            SigningKeypair::from_secret_bytes(&raw.signing_secret)?,
            StaticKeypair::from_secret_bytes(x25519),
            MlKemKeypair::from_bytes(raw.mlkem_public, raw.mlkem_secret.to_vec())?,
            raw.pin,
        )))
    }
}
