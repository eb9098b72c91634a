//! Shared fixtures: engines wired together over one loopback network.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use torlink_core::crypto::SigningKeypair;
use torlink_core::identity::{IdentityAddresses, LocalIdentity, OnionAddress};
use torlink_core::storage::{Database, IdentityStore};
use torlink_core::transport::LoopbackNetwork;
use torlink_core::{DeliveryMachine, EngineConfig, EngineContext, HandshakeEngine, Router};

pub fn random_onion() -> OnionAddress {
    OnionAddress::from_public_key(&SigningKeypair::generate().verifying_key())
}

pub fn identity(name: &str, config: &EngineConfig) -> LocalIdentity {
    let addresses = IdentityAddresses {
        messaging: random_onion(),
        voice: random_onion(),
        friend_request: random_onion(),
    };
    LocalIdentity::generate(name, addresses, config.pin_mode).expect("identity")
}

/// One engine with its router listening on the shared network.
pub struct Peer {
    pub ctx: EngineContext,
    pub handshake: HandshakeEngine,
    pub delivery: DeliveryMachine,
    _stop: watch::Sender<bool>,
}

impl Peer {
    pub fn join(network: &LoopbackNetwork, name: &str, config: EngineConfig) -> Self {
        let db = Database::open_in_memory().expect("db");
        let identity = identity(name, &config);
        Self::join_with(network, db, identity, config)
    }

    /// Join with an existing database; the identity is stored in it first.
    pub fn join_with(
        network: &LoopbackNetwork,
        db: Database,
        identity: LocalIdentity,
        config: EngineConfig,
    ) -> Self {
        IdentityStore::new(db.clone()).save(&identity).expect("save identity");
        let ctx = EngineContext::new(db, config, identity, Arc::new(network.transport()))
            .expect("context");

        let addresses = &ctx.identity().addresses;
        let rx = network.register_all(&[
            addresses.messaging.as_str(),
            addresses.voice.as_str(),
            addresses.friend_request.as_str(),
        ]);
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(Router::new(ctx.clone()).run(rx, shutdown));

        Self {
            handshake: HandshakeEngine::new(ctx.clone()),
            delivery: DeliveryMachine::new(ctx.clone()),
            ctx,
            _stop: stop,
        }
    }

    pub fn friend_request_address(&self) -> String {
        self.ctx.identity().addresses.friend_request.to_string()
    }

    pub fn messaging_address(&self) -> String {
        self.ctx.identity().addresses.messaging.to_string()
    }

    pub fn pin(&self) -> String {
        self.ctx.identity().pin().to_string()
    }

    /// Id of the contact whose messaging address is `peer`'s.
    pub fn contact_id(&self, peer: &Peer) -> i64 {
        self.try_contact_id(peer).expect("contact")
    }

    pub fn try_contact_id(&self, peer: &Peer) -> Option<i64> {
        self.ctx
            .contacts()
            .get_by_address(&peer.messaging_address())
            .expect("lookup")
            .map(|contact| contact.id)
    }

    /// Whether an incoming message with `ping_id` has been stored.
    pub fn has_message(&self, ping_id: &str) -> bool {
        self.ctx
            .messages()
            .get_by_ping(ping_id)
            .expect("get")
            .is_some_and(|message| !message.outgoing)
    }
}

/// Poll `check` until it holds. Replies to a frame are sent after the
/// frame is answered, so their effects land shortly after a send returns.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Run the whole handshake between two online peers. Returns
/// `(bob's id at alice, alice's id at bob)`.
pub async fn befriend(alice: &Peer, bob: &Peer) -> (i64, i64) {
    alice
        .handshake
        .initiate(&bob.friend_request_address(), &bob.pin())
        .await
        .expect("initiate");
    let incoming = bob
        .handshake
        .list_requests()
        .expect("list")
        .into_iter()
        .next()
        .expect("incoming request")
        .id;
    bob.handshake.accept(incoming).await.expect("accept");
    eventually("confirmation", || bob.try_contact_id(alice).is_some()).await;
    (alice.contact_id(bob), bob.contact_id(alice))
}

/// Make every queued outbox item due now.
pub fn make_outbox_due(ctx: &EngineContext) {
    ctx.db()
        .with_conn(|conn| {
            conn.execute("UPDATE outbox SET next_retry_at = 0", [])?;
            Ok(())
        })
        .expect("backdate outbox");
}
