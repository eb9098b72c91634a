//! Persistence across restarts and the retry worker's housekeeping.

mod common;

use common::{identity, make_outbox_due, Peer};
use std::sync::Arc;
use torlink_core::storage::{Database, DatabaseConfig, IdentityStore, OutboxStatus, RequestStatus};
use torlink_core::transport::LoopbackNetwork;
use torlink_core::{EngineConfig, EngineContext, EngineEvent, HandshakeOutcome, RetryWorker};

fn open(path: &str) -> Database {
    Database::open(&DatabaseConfig {
        path: path.to_string(),
        in_memory: false,
    })
    .expect("open")
}

#[tokio::test]
async fn test_queued_request_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("alice.db").to_string_lossy().to_string();
    let network = LoopbackNetwork::new();
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    network.set_reachable(&bob.friend_request_address(), false);

    let request_id = {
        let alice = Peer::join_with(
            &network,
            open(&path),
            identity("alice", &EngineConfig::default()),
            EngineConfig::default(),
        );
        let id = alice
            .handshake
            .initiate(&bob.friend_request_address(), &bob.pin())
            .await
            .expect("initiate");
        let request = alice.ctx.requests().get(id).expect("get").expect("request");
        assert_eq!(request.status, RequestStatus::Sending);
        id
    };
    assert!(bob.handshake.list_requests().expect("list").is_empty());

    // Reopen from disk: identity, request and outbox item are all there.
    let db = open(&path);
    let identity = IdentityStore::new(db.clone())
        .load()
        .expect("load")
        .expect("identity");
    let ctx = EngineContext::new(
        db,
        EngineConfig::default(),
        identity,
        Arc::new(network.transport()),
    )
    .expect("context");
    let item = ctx
        .outbox()
        .get_by_key(&format!("fr:{}", request_id))
        .expect("get")
        .expect("item");
    assert_eq!(item.status, OutboxStatus::Pending);

    network.set_reachable(&bob.friend_request_address(), true);
    make_outbox_due(&ctx);
    let report = RetryWorker::new(ctx.clone()).run_once().await.expect("tick");
    assert_eq!(report.delivered, 1);

    let request = ctx.requests().get(request_id).expect("get").expect("request");
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(bob.handshake.list_requests().expect("list").len(), 1);
}

#[tokio::test]
async fn test_stale_request_is_demoted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("alice.db").to_string_lossy().to_string();
    let network = LoopbackNetwork::new();
    let alice = Peer::join_with(
        &network,
        open(&path),
        identity("alice", &EngineConfig::default()),
        EngineConfig::default(),
    );
    let nobody = common::random_onion().to_string();
    let mut events = alice.ctx.subscribe();

    let request_id = alice
        .handshake
        .initiate(&nobody, "1234567890")
        .await
        .expect("initiate");
    alice
        .ctx
        .db()
        .with_conn(|conn| {
            conn.execute(
                "UPDATE pending_friend_requests SET sending_since = sending_since - 3600",
                [],
            )?;
            Ok(())
        })
        .expect("backdate");

    let report = RetryWorker::new(alice.ctx.clone()).run_once().await.expect("tick");
    assert_eq!(report.demoted, 1);

    let request = alice.ctx.requests().get(request_id).expect("get").expect("request");
    assert_eq!(request.status, RequestStatus::Failed);
    let item = alice
        .ctx
        .outbox()
        .get_by_key(&format!("fr:{}", request_id))
        .expect("get")
        .expect("item");
    assert_eq!(item.status, OutboxStatus::Failed);
    assert_eq!(
        events.recv().await.expect("event"),
        EngineEvent::Handshake {
            request_id: Some(request_id),
            outcome: HandshakeOutcome::Stale,
        }
    );

    // A failed request can be resent; it is SENDING again.
    assert!(!alice.handshake.resend(request_id).await.expect("resend"));
    let request = alice.ctx.requests().get(request_id).expect("get").expect("request");
    assert_eq!(request.status, RequestStatus::Sending);
}
