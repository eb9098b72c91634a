//! Ping, pong and message exchange between befriended engines.

mod common;

use common::{befriend, eventually, make_outbox_due, Peer};
use std::time::Duration;
use torlink_core::config::DownloadMode;
use torlink_core::protocol::ContentType;
use torlink_core::storage::{OutboxStatus, PingState};
use torlink_core::transport::LoopbackNetwork;
use torlink_core::{
    ContactDeliveryState, EngineConfig, EngineEvent, Error, Indicator, RetryWorker,
};

fn manual() -> EngineConfig {
    EngineConfig {
        download_mode: DownloadMode::Manual,
        ..EngineConfig::default()
    }
}

fn outbox_status(peer: &Peer, key: &str) -> OutboxStatus {
    peer.ctx
        .outbox()
        .get_by_key(key)
        .expect("get")
        .expect("item")
        .status
}

#[tokio::test]
async fn test_auto_mode_delivers_message() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    let (bob_at_alice, alice_at_bob) = befriend(&alice, &bob).await;

    let ping_id = alice
        .delivery
        .send_message(bob_at_alice, ContentType::Text, b"hello bob")
        .await
        .expect("send");

    let msg_key = format!("msg:{}", ping_id);
    eventually("message delivered", || {
        outbox_status(&alice, &msg_key) == OutboxStatus::Delivered
    })
    .await;
    let stored = bob
        .ctx
        .messages()
        .get_by_ping(&ping_id)
        .expect("get")
        .expect("message");
    assert_eq!(stored.body, b"hello bob");
    assert_eq!(stored.contact_id, alice_at_bob);
    assert!(!stored.outgoing);

    assert_eq!(outbox_status(&alice, &format!("ping:{}", ping_id)), OutboxStatus::Delivered);
    assert!(bob.ctx.inbox().list_for_contact(alice_at_bob).expect("list").is_empty());
    assert_eq!(
        bob.delivery.contact_state(alice_at_bob).expect("state"),
        ContactDeliveryState::Idle
    );

    // Replies use the other half of the chain.
    let reply = bob
        .delivery
        .send_message(alice_at_bob, ContentType::Text, b"hi alice")
        .await
        .expect("reply");
    eventually("reply stored", || alice.has_message(&reply)).await;
    let stored = alice.ctx.messages().get_by_ping(&reply).expect("get").expect("reply");
    assert_eq!(stored.body, b"hi alice");
    assert_eq!(alice.ctx.keychain().counters(bob_at_alice).expect("counters"), Some((1, 1)));
}

#[tokio::test]
async fn test_manual_mode_waits_for_user() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", manual());
    let (bob_at_alice, alice_at_bob) = befriend(&alice, &bob).await;

    let first = alice
        .delivery
        .send_message(bob_at_alice, ContentType::Text, b"one")
        .await
        .expect("send");
    assert!(bob.ctx.messages().get_by_ping(&first).expect("get").is_none());
    assert_eq!(outbox_status(&alice, &format!("ping:{}", first)), OutboxStatus::Delivered);
    assert_eq!(outbox_status(&alice, &format!("msg:{}", first)), OutboxStatus::Held);

    let pending = bob.delivery.visible_pending(alice_at_bob).expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, PingState::ManualRequired);
    assert_eq!(
        bob.delivery.indicator(alice_at_bob).expect("indicator"),
        Indicator::Locked {
            entry_ids: vec![pending[0].id]
        }
    );
    assert_eq!(
        bob.delivery.contact_state(alice_at_bob).expect("state"),
        ContactDeliveryState::Paused
    );

    let mut bob_events = bob.ctx.subscribe();
    bob.delivery.manual_download(pending[0].id).await.expect("download");
    let (ping_id, silent) = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let EngineEvent::MessageReceived { ping_id, silent, .. } =
                bob_events.recv().await.expect("event")
            {
                break (ping_id, silent);
            }
        }
    })
    .await
    .expect("message received");
    assert_eq!(ping_id, first);
    assert!(!silent);
    let stored = bob.ctx.messages().get_by_ping(&first).expect("get").expect("message");
    assert_eq!(stored.body, b"one");
    assert!(bob.delivery.visible_pending(alice_at_bob).expect("pending").is_empty());

    // The download enabled auto-pong for alice for the rest of the session.
    assert!(bob.ctx.auto_pong(alice_at_bob).expect("auto pong"));
    let second = alice
        .delivery
        .send_message(bob_at_alice, ContentType::Text, b"two")
        .await
        .expect("send");
    eventually("second message", || bob.has_message(&second)).await;
    let stored = bob.ctx.messages().get_by_ping(&second).expect("get").expect("message");
    assert_eq!(stored.body, b"two");
}

#[tokio::test]
async fn test_concurrent_downloads_claim_once() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", manual());
    let (bob_at_alice, alice_at_bob) = befriend(&alice, &bob).await;

    let ping_id = alice
        .delivery
        .send_message(bob_at_alice, ContentType::Text, b"race")
        .await
        .expect("send");
    let entry = bob.delivery.visible_pending(alice_at_bob).expect("pending")[0].id;

    let (a, b) = tokio::join!(
        bob.delivery.manual_download(entry),
        bob.delivery.manual_download(entry)
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(Error::ClaimConflict(id)) if *id == entry)));

    eventually("download", || bob.has_message(&ping_id)).await;
    let messages = bob.ctx.messages().list_for_contact(alice_at_bob, 10).expect("list");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].ping_id, ping_id);
}

#[tokio::test]
async fn test_profile_sync_is_silent() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", manual());
    let (bob_at_alice, alice_at_bob) = befriend(&alice, &bob).await;

    alice
        .delivery
        .send_message(bob_at_alice, ContentType::ProfileSync, b"{\"name\":\"alice\"}")
        .await
        .expect("send");

    // Stored in the inbox, never surfaced.
    assert_eq!(bob.ctx.inbox().list_for_contact(alice_at_bob).expect("list").len(), 1);
    assert!(bob.delivery.visible_pending(alice_at_bob).expect("pending").is_empty());
    assert_eq!(bob.delivery.indicator(alice_at_bob).expect("indicator"), Indicator::None);
}

#[tokio::test]
async fn test_offline_peer_gets_message_after_retry() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    let (bob_at_alice, _) = befriend(&alice, &bob).await;

    network.set_reachable(&bob.messaging_address(), false);
    let ping_id = alice
        .delivery
        .send_message(bob_at_alice, ContentType::Text, b"later")
        .await
        .expect("send");
    assert_eq!(outbox_status(&alice, &format!("ping:{}", ping_id)), OutboxStatus::Pending);
    assert!(bob.ctx.messages().get_by_ping(&ping_id).expect("get").is_none());

    network.set_reachable(&bob.messaging_address(), true);
    make_outbox_due(&alice.ctx);
    let report = RetryWorker::new(alice.ctx.clone()).run_once().await.expect("tick");
    assert!(report.delivered >= 1);

    eventually("retried message", || bob.has_message(&ping_id)).await;
    let msg_key = format!("msg:{}", ping_id);
    eventually("message delivered", || {
        outbox_status(&alice, &msg_key) == OutboxStatus::Delivered
    })
    .await;
    let stored = bob.ctx.messages().get_by_ping(&ping_id).expect("get").expect("message");
    assert_eq!(stored.body, b"later");
}

#[tokio::test]
async fn test_blocked_contact_is_ignored() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    let (bob_at_alice, alice_at_bob) = befriend(&alice, &bob).await;

    bob.ctx.contacts().set_blocked(alice_at_bob, true).expect("block");
    let ping_id = alice
        .delivery
        .send_message(bob_at_alice, ContentType::Text, b"anyone?")
        .await
        .expect("send");

    assert!(bob.ctx.inbox().list_for_contact(alice_at_bob).expect("list").is_empty());
    assert!(bob.ctx.messages().get_by_ping(&ping_id).expect("get").is_none());
    assert_eq!(outbox_status(&alice, &format!("msg:{}", ping_id)), OutboxStatus::Held);
}

#[tokio::test]
async fn test_ping_is_answered_before_replies_go_out() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    let (bob_at_alice, alice_at_bob) = befriend(&alice, &bob).await;

    // Bob's ack and pong to alice land in a queue nobody reads, so any
    // reply sent before the verdict would stall alice's send.
    let _stalled = network.register(&alice.messaging_address());
    let ping_id = tokio::time::timeout(
        Duration::from_secs(5),
        alice
            .delivery
            .send_message(bob_at_alice, ContentType::Text, b"quick"),
    )
    .await
    .expect("answered without waiting for replies")
    .expect("send");

    assert_eq!(outbox_status(&alice, &format!("ping:{}", ping_id)), OutboxStatus::Delivered);
    let entry = bob
        .ctx
        .inbox()
        .get_by_ping(&ping_id)
        .expect("get")
        .expect("entry");
    assert_eq!(entry.contact_id, alice_at_bob);
    assert!(entry.state.is_pending());
}
