//! Per-contact key chain manager.
//!
//! Each contact owns two symmetric chains seeded from the handshake
//! secret: one we send on and one the peer sends on. Every message
//! advances its chain by one step and uses a fresh message key.
//!
//! ## Receive Rules
//!
//! For an envelope with counter `N` and expected counter `R`:
//!
//! - `N == R`: derive, decrypt, `R = N + 1`
//! - `N > R`: cache keys for `[R, N)`, decrypt with the key for `N`, `R = N + 1`
//! - `N < R`: decrypt with the cached key for `N` and remove it, or fail
//!
//! All state changes for one message commit in a single transaction, so an
//! authentication failure leaves the chain exactly as it was.
//!
//! ## Concurrency
//!
//! Operations on one contact are serialised by a per-contact async mutex.
//! Different contacts never contend.

use crate::config::EngineConfig;
use crate::crypto::chain::{derive_root_key, direction_chain_keys, kdf_chain, CHAIN_KEY_SIZE};
use crate::crypto::{decrypt, encrypt, random_nonce, KEY_SIZE};
use crate::error::{Error, Result};
use crate::logging::RedactedOnion;
use crate::protocol::Envelope;
use crate::storage::{now, Database, KeyChainRecord, KeyChainStore};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use zeroize::Zeroizing;

/// Owns all key chains in one database.
pub struct KeyChainManager {
    store: KeyChainStore,
    max_skip: u64,
    skipped_key_ttl_secs: i64,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyChainManager {
    /// Create a manager over `db`.
    pub fn new(db: Database, config: &EngineConfig) -> Self {
        Self {
            store: KeyChainStore::new(db),
            max_skip: config.max_skip,
            skipped_key_ttl_secs: config.skipped_key_ttl_secs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn contact_lock(&self, contact_id: i64) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))?;
        Ok(locks.entry(contact_id).or_default().clone())
    }

    /// Seed a contact's chains inside the caller's transaction.
    pub(crate) fn initialize_with(
        conn: &Connection,
        contact_id: i64,
        shared_secret: &[u8],
        own_address: &str,
        peer_address: &str,
    ) -> Result<()> {
        let root = derive_root_key(shared_secret)?;
        let (send, recv) = direction_chain_keys(&*root, own_address, peer_address)?;
        let record = KeyChainRecord {
            contact_id,
            root_key: Zeroizing::new(root.to_vec()),
            send_chain_key: Zeroizing::new(send.to_vec()),
            recv_chain_key: Zeroizing::new(recv.to_vec()),
            send_counter: 0,
            recv_counter: 0,
        };
        KeyChainStore::insert_with(conn, &record, now())?;
        debug!(contact_id, peer = %RedactedOnion(peer_address), "key chain initialized");
        Ok(())
    }

    /// Seed a contact's chains from the handshake secret.
    ///
    /// `own_address` and `peer_address` are the two messaging addresses;
    /// their order decides which chain each side sends on.
    pub fn initialize(
        &self,
        contact_id: i64,
        shared_secret: &[u8],
        own_address: &str,
        peer_address: &str,
    ) -> Result<()> {
        self.store.database().with_conn(|conn| {
            Self::initialize_with(conn, contact_id, shared_secret, own_address, peer_address)
        })
    }

    /// Encrypt the next outgoing message. Returns the counter used and the
    /// encoded envelope.
    pub async fn encrypt_message(&self, contact_id: i64, plaintext: &[u8]) -> Result<(u64, Vec<u8>)> {
        let lock = self.contact_lock(contact_id)?;
        let _guard = lock.lock().await;

        self.store.database().transaction(|tx| {
            let mut record = KeyChainStore::load_with(tx, contact_id)?
                .ok_or_else(|| Error::NotFound(format!("key chain for contact {}", contact_id)))?;
            let counter = record.send_counter;
            let (next, message_key) = kdf_chain(&record.send_chain_key)?;

            let nonce = random_nonce();
            let ciphertext = encrypt(&message_key, &nonce, plaintext, &Envelope::header(counter))?;

            record.send_chain_key = Zeroizing::new(next.to_vec());
            record.send_counter = counter
                .checked_add(1)
                .ok_or_else(|| Error::Protocol("send counter exhausted".into()))?;
            KeyChainStore::advance_with(tx, &record, now())?;

            let envelope = Envelope {
                counter,
                nonce,
                ciphertext,
            };
            Ok((counter, envelope.to_bytes()))
        })
    }

    /// Decrypt an incoming envelope, advancing the receive chain.
    pub async fn decrypt_message(
        &self,
        contact_id: i64,
        envelope: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = Envelope::from_bytes(envelope)?;
        let counter = envelope.counter;
        let lock = self.contact_lock(contact_id)?;
        let _guard = lock.lock().await;

        let result = self.store.database().transaction(|tx| {
            let mut record = KeyChainStore::load_with(tx, contact_id)?
                .ok_or_else(|| Error::NotFound(format!("key chain for contact {}", contact_id)))?;

            if counter < record.recv_counter {
                let cached = KeyChainStore::take_skipped_with(tx, contact_id, counter)?
                    .ok_or(Error::UndecryptableMessage { counter })?;
                let key: [u8; KEY_SIZE] = cached
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::StorageCorrupt("skipped key length".into()))?;
                let key = Zeroizing::new(key);
                return open(&key, &envelope);
            }

            if counter - record.recv_counter > self.max_skip {
                return Err(Error::UndecryptableMessage { counter });
            }

            let at = now();
            let mut chain_key = Zeroizing::new(record.recv_chain_key.to_vec());
            for skipped in record.recv_counter..counter {
                let (next, message_key) = kdf_chain(&chain_key)?;
                KeyChainStore::insert_skipped_with(tx, contact_id, skipped, &*message_key, at)?;
                chain_key = Zeroizing::new(next.to_vec());
            }
            let (next, message_key) = kdf_chain(&chain_key)?;
            let plaintext = open(&message_key, &envelope)?;

            record.recv_chain_key = Zeroizing::new(next.to_vec());
            record.recv_counter = counter
                .checked_add(1)
                .ok_or_else(|| Error::Protocol("receive counter exhausted".into()))?;
            KeyChainStore::advance_with(tx, &record, at)?;
            Ok(plaintext)
        });

        if let Err(Error::UndecryptableMessage { counter }) = &result {
            debug!(contact_id, counter, "message could not be decrypted");
        }
        result
    }

    /// `(send_counter, recv_counter)` for a contact.
    pub fn counters(&self, contact_id: i64) -> Result<Option<(u64, u64)>> {
        Ok(self
            .store
            .load(contact_id)?
            .map(|r| (r.send_counter, r.recv_counter)))
    }

    /// Counters with a cached skipped key.
    pub fn skipped_counters(&self, contact_id: i64) -> Result<Vec<u64>> {
        self.store.skipped_counters(contact_id)
    }

    /// Delete skipped keys older than the configured TTL.
    pub fn sweep_skipped_keys(&self, at: i64) -> Result<usize> {
        let deleted = self
            .store
            .delete_skipped_before(at - self.skipped_key_ttl_secs)?;
        if deleted > 0 {
            debug!(deleted, "swept expired skipped keys");
        }
        Ok(deleted)
    }

    /// Reset both counters to zero and re-derive the chains from the root.
    ///
    /// DANGEROUS: only recovers a desynchronised conversation if the peer
    /// performs the same reset at the same time. Otherwise every later
    /// message on either side is undecryptable.
    #[cfg(any(debug_assertions, feature = "dangerous-debug"))]
    pub async fn reset_counters_dangerous(
        &self,
        contact_id: i64,
        own_address: &str,
        peer_address: &str,
    ) -> Result<()> {
        let lock = self.contact_lock(contact_id)?;
        let _guard = lock.lock().await;

        self.store.database().transaction(|tx| {
            let mut record = KeyChainStore::load_with(tx, contact_id)?
                .ok_or_else(|| Error::NotFound(format!("key chain for contact {}", contact_id)))?;
            let (send, recv) = direction_chain_keys(&record.root_key, own_address, peer_address)?;
            record.send_chain_key = Zeroizing::new(send.to_vec());
            record.recv_chain_key = Zeroizing::new(recv.to_vec());
            record.send_counter = 0;
            record.recv_counter = 0;
            KeyChainStore::overwrite_with(tx, &record, now())?;
            KeyChainStore::clear_skipped_with(tx, contact_id)?;
            Ok(())
        })?;

        tracing::warn!(contact_id, "key chain counters reset; both sides must reset together");
        Ok(())
    }
}

impl std::fmt::Debug for KeyChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyChainManager")
            .field("max_skip", &self.max_skip)
            .finish_non_exhaustive()
    }
}

fn open(message_key: &[u8; CHAIN_KEY_SIZE], envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>> {
    decrypt(
        message_key,
        &envelope.nonce,
        &envelope.ciphertext,
        &Envelope::header(envelope.counter),
    )
    .map_err(|_| Error::UndecryptableMessage {
        counter: envelope.counter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contact_support::new_contact;
    use crate::storage::ContactStore;

    const ALICE: &str = "aaaa.onion";
    const BOB: &str = "bbbb.onion";

    struct Pair {
        alice: KeyChainManager,
        bob: KeyChainManager,
        alice_contact: i64,
        bob_contact: i64,
    }

    fn pair(config: &EngineConfig) -> Pair {
        let secret = [7u8; 64];
        let alice_db = Database::open_in_memory().expect("db");
        let bob_db = Database::open_in_memory().expect("db");
        let alice_contact = ContactStore::new(alice_db.clone())
            .insert(&new_contact("bob"))
            .expect("contact");
        let bob_contact = ContactStore::new(bob_db.clone())
            .insert(&new_contact("alice"))
            .expect("contact");

        let alice = KeyChainManager::new(alice_db, config);
        let bob = KeyChainManager::new(bob_db, config);
        alice
            .initialize(alice_contact, &secret, ALICE, BOB)
            .expect("init alice");
        bob.initialize(bob_contact, &secret, BOB, ALICE)
            .expect("init bob");
        Pair {
            alice,
            bob,
            alice_contact,
            bob_contact,
        }
    }

    #[tokio::test]
    async fn test_in_order_exchange() {
        let p = pair(&EngineConfig::default());
        for i in 0..3u64 {
            let (counter, env) = p
                .alice
                .encrypt_message(p.alice_contact, format!("hi {}", i).as_bytes())
                .await
                .expect("encrypt");
            assert_eq!(counter, i);
            let plain = p.bob.decrypt_message(p.bob_contact, &env).await.expect("decrypt");
            assert_eq!(plain.as_slice(), format!("hi {}", i).as_bytes());
        }

        let (_, reply) = p
            .bob
            .encrypt_message(p.bob_contact, b"back")
            .await
            .expect("encrypt");
        let plain = p
            .alice
            .decrypt_message(p.alice_contact, &reply)
            .await
            .expect("decrypt");
        assert_eq!(plain.as_slice(), b"back");
        assert_eq!(p.alice.counters(p.alice_contact).expect("c"), Some((3, 1)));
    }

    #[tokio::test]
    async fn test_out_of_order_0_2_1() {
        let p = pair(&EngineConfig::default());
        let mut envs = Vec::new();
        for i in 0..3 {
            let (_, env) = p
                .alice
                .encrypt_message(p.alice_contact, &[i])
                .await
                .expect("encrypt");
            envs.push(env);
        }

        p.bob.decrypt_message(p.bob_contact, &envs[0]).await.expect("0");
        assert_eq!(p.bob.counters(p.bob_contact).expect("c"), Some((0, 1)));

        let two = p.bob.decrypt_message(p.bob_contact, &envs[2]).await.expect("2");
        assert_eq!(two.as_slice(), &[2]);
        assert_eq!(p.bob.counters(p.bob_contact).expect("c"), Some((0, 3)));
        assert_eq!(p.bob.skipped_counters(p.bob_contact).expect("s"), vec![1]);

        let one = p.bob.decrypt_message(p.bob_contact, &envs[1]).await.expect("1");
        assert_eq!(one.as_slice(), &[1]);
        assert!(p.bob.skipped_counters(p.bob_contact).expect("s").is_empty());
        assert_eq!(p.bob.counters(p.bob_contact).expect("c"), Some((0, 3)));

        // Replaying a consumed counter is a non-fatal error.
        let replay = p.bob.decrypt_message(p.bob_contact, &envs[1]).await;
        assert!(matches!(replay, Err(Error::UndecryptableMessage { counter: 1 })));
        let (_, next) = p
            .alice
            .encrypt_message(p.alice_contact, b"still works")
            .await
            .expect("encrypt");
        p.bob.decrypt_message(p.bob_contact, &next).await.expect("chain intact");
    }

    #[tokio::test]
    async fn test_concurrent_sends_use_distinct_counters() {
        let p = Arc::new(pair(&EngineConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                p.alice
                    .encrypt_message(p.alice_contact, b"x")
                    .await
                    .expect("encrypt")
                    .0
            }));
        }
        let mut counters = Vec::new();
        for h in handles {
            counters.push(h.await.expect("join"));
        }
        counters.sort_unstable();
        assert_eq!(counters, (0..16).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_gap_beyond_max_skip_leaves_state() {
        let config = EngineConfig {
            max_skip: 2,
            ..EngineConfig::default()
        };
        let p = pair(&config);
        let mut last = Vec::new();
        for _ in 0..4 {
            last = p
                .alice
                .encrypt_message(p.alice_contact, b"x")
                .await
                .expect("encrypt")
                .1;
        }
        let result = p.bob.decrypt_message(p.bob_contact, &last).await;
        assert!(matches!(result, Err(Error::UndecryptableMessage { counter: 3 })));
        assert_eq!(p.bob.counters(p.bob_contact).expect("c"), Some((0, 0)));
        assert!(p.bob.skipped_counters(p.bob_contact).expect("s").is_empty());
    }

    #[tokio::test]
    async fn test_tampered_envelope_rolls_back() {
        let p = pair(&EngineConfig::default());
        let (_, _) = p
            .alice
            .encrypt_message(p.alice_contact, b"zero")
            .await
            .expect("encrypt");
        let (_, mut env) = p
            .alice
            .encrypt_message(p.alice_contact, b"one")
            .await
            .expect("encrypt");
        let last = env.len() - 1;
        env[last] ^= 0x01;

        let result = p.bob.decrypt_message(p.bob_contact, &env).await;
        assert!(matches!(result, Err(Error::UndecryptableMessage { counter: 1 })));
        assert_eq!(p.bob.counters(p.bob_contact).expect("c"), Some((0, 0)));
        assert!(p.bob.skipped_counters(p.bob_contact).expect("s").is_empty());
    }

    #[tokio::test]
    async fn test_sweep_respects_ttl() {
        let p = pair(&EngineConfig::default());
        let mut envs = Vec::new();
        for _ in 0..2 {
            envs.push(
                p.alice
                    .encrypt_message(p.alice_contact, b"x")
                    .await
                    .expect("encrypt")
                    .1,
            );
        }
        p.bob.decrypt_message(p.bob_contact, &envs[1]).await.expect("skip one");
        assert_eq!(p.bob.sweep_skipped_keys(now()).expect("sweep"), 0);

        let later = now() + EngineConfig::default().skipped_key_ttl_secs + 1;
        assert_eq!(p.bob.sweep_skipped_keys(later).expect("sweep"), 1);
        assert!(matches!(
            p.bob.decrypt_message(p.bob_contact, &envs[0]).await,
            Err(Error::UndecryptableMessage { counter: 0 })
        ));
    }

    #[tokio::test]
    async fn test_reset_counters_dangerous() {
        let p = pair(&EngineConfig::default());
        let (_, env) = p
            .alice
            .encrypt_message(p.alice_contact, b"x")
            .await
            .expect("encrypt");
        p.bob.decrypt_message(p.bob_contact, &env).await.expect("decrypt");

        p.alice
            .reset_counters_dangerous(p.alice_contact, ALICE, BOB)
            .await
            .expect("reset alice");
        p.bob
            .reset_counters_dangerous(p.bob_contact, BOB, ALICE)
            .await
            .expect("reset bob");

        let (counter, env) = p
            .alice
            .encrypt_message(p.alice_contact, b"again")
            .await
            .expect("encrypt");
        assert_eq!(counter, 0);
        let plain = p.bob.decrypt_message(p.bob_contact, &env).await.expect("decrypt");
        assert_eq!(plain.as_slice(), b"again");
    }
}
