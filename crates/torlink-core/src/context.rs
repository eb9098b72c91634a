//! Shared engine state.
//!
//! An [`EngineContext`] is built once by the host and cloned into the
//! handshake engine, the delivery machine, the router and the retry worker.
//! Cloning is cheap: every field is a handle.

use crate::config::EngineConfig;
use crate::delivery::ContactDeliveryState;
use crate::error::{Error, Result};
use crate::events::{self, EngineEvent};
use crate::identity::LocalIdentity;
use crate::keychain::KeyChainManager;
use crate::storage::{
    ContactStore, Database, InboxStore, MessageStore, Outbox, RequestStore,
};
use crate::transport::{Transport, TransportGate};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;

/// Per-process state that is deliberately not persisted.
#[derive(Debug, Default)]
struct Session {
    /// Contacts whose pings are auto-ponged in manual mode.
    auto_pong: HashSet<i64>,
    /// Last aggregate state published per contact.
    delivery_states: HashMap<i64, ContactDeliveryState>,
}

/// Handles shared by every engine component.
#[derive(Clone)]
pub struct EngineContext {
    db: Database,
    config: Arc<EngineConfig>,
    identity: Arc<LocalIdentity>,
    gate: Arc<TransportGate>,
    keychain: Arc<KeyChainManager>,
    events: broadcast::Sender<EngineEvent>,
    session: Arc<Mutex<Session>>,
}

impl EngineContext {
    /// Assemble a context around an open database and a transport.
    pub fn new(
        db: Database,
        config: EngineConfig,
        identity: LocalIdentity,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let gate = TransportGate::new(transport, config.transport.gate_timeout());
        let keychain = KeyChainManager::new(db.clone(), &config);
        Ok(Self {
            db,
            config: Arc::new(config),
            identity: Arc::new(identity),
            gate: Arc::new(gate),
            keychain: Arc::new(keychain),
            events: events::channel(),
            session: Arc::new(Mutex::new(Session::default())),
        })
    }

    /// Database handle.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Local identity.
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Transport gate.
    pub fn gate(&self) -> &TransportGate {
        &self.gate
    }

    /// Key chain manager.
    pub fn keychain(&self) -> &KeyChainManager {
        &self.keychain
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        trace!(?event, "engine event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Contact table.
    pub fn contacts(&self) -> ContactStore {
        ContactStore::new(self.db.clone())
    }

    /// Friend-request table.
    pub fn requests(&self) -> RequestStore {
        RequestStore::new(self.db.clone())
    }

    /// Ping inbox.
    pub fn inbox(&self) -> InboxStore {
        InboxStore::new(self.db.clone())
    }

    /// Plaintext messages.
    pub fn messages(&self) -> MessageStore {
        MessageStore::new(self.db.clone())
    }

    /// Outbound queue.
    pub fn outbox(&self) -> Outbox {
        Outbox::new(self.db.clone())
    }

    fn session(&self) -> Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| Error::Storage("session lock poisoned".into()))
    }

    /// Whether pings from `contact_id` are auto-ponged this session.
    pub fn auto_pong(&self, contact_id: i64) -> Result<bool> {
        Ok(self.session()?.auto_pong.contains(&contact_id))
    }

    pub(crate) fn enable_auto_pong(&self, contact_id: i64) -> Result<()> {
        self.session()?.auto_pong.insert(contact_id);
        Ok(())
    }

    pub(crate) fn forget_contact(&self, contact_id: i64) -> Result<()> {
        let mut session = self.session()?;
        session.auto_pong.remove(&contact_id);
        session.delivery_states.remove(&contact_id);
        Ok(())
    }

    /// Record `state` for `contact_id`; true if it differs from the last
    /// published value.
    pub(crate) fn swap_delivery_state(
        &self,
        contact_id: i64,
        state: ContactDeliveryState,
    ) -> Result<bool> {
        let previous = self.session()?.delivery_states.insert(contact_id, state);
        Ok(previous.unwrap_or(ContactDeliveryState::Idle) != state)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("identity", &self.identity)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::identity::test_support::identity;
    use crate::transport::LoopbackNetwork;

    /// Context over an in-memory database and an isolated loopback network.
    pub fn context(name: &str, config: EngineConfig) -> (EngineContext, LoopbackNetwork) {
        let network = LoopbackNetwork::new();
        let db = Database::open_in_memory().expect("db");
        let ctx = EngineContext::new(db, config, identity(name), Arc::new(network.transport()))
            .expect("context");
        (ctx, network)
    }
}
