//! Friend requests between two engines on one network.

mod common;

use common::{befriend, eventually, Peer};
use torlink_core::config::PinMode;
use torlink_core::crypto::encrypt_with_secret;
use torlink_core::handshake::Phase1Payload;
use torlink_core::protocol::{ContentType, Frame, WireType};
use torlink_core::storage::{FriendshipStatus, RequestDirection, RequestStatus};
use torlink_core::transport::{LoopbackNetwork, Transport};
use torlink_core::{EngineConfig, EngineEvent, Error, HandshakeOutcome};

#[tokio::test]
async fn test_handshake_over_network() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    let mut bob_events = bob.ctx.subscribe();

    let outgoing = alice
        .handshake
        .initiate(&bob.friend_request_address(), &bob.pin())
        .await
        .expect("initiate");
    let sent = alice.ctx.requests().get(outgoing).expect("get").expect("request");
    assert_eq!(sent.status, RequestStatus::Pending);

    let requests = bob.handshake.list_requests().expect("list");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].direction, RequestDirection::Incoming);
    assert_eq!(requests[0].peer_address, alice.friend_request_address());
    assert_eq!(
        bob_events.recv().await.expect("event"),
        EngineEvent::RequestReceived {
            request_id: requests[0].id
        }
    );

    bob.handshake.accept(requests[0].id).await.expect("accept");

    // Alice stored bob before answering Phase 2; the confirmation follows.
    let bob_at_alice = alice.contact_id(&bob);
    eventually("confirmation", || bob.try_contact_id(&alice).is_some()).await;
    let alice_at_bob = bob.contact_id(&alice);
    for (peer, contact_id, name) in [(&alice, bob_at_alice, "bob"), (&bob, alice_at_bob, "alice")] {
        let contact = peer.ctx.contacts().get(contact_id).expect("get").expect("contact");
        assert_eq!(contact.display_name, name);
        assert_eq!(contact.status, FriendshipStatus::Confirmed);
        assert!(peer.handshake.list_requests().expect("list").is_empty());
        assert_eq!(peer.ctx.keychain().counters(contact_id).expect("counters"), Some((0, 0)));
    }

    let alice_contact = bob.ctx.contacts().get(alice_at_bob).expect("get").expect("contact");
    assert_eq!(
        alice_contact.signing_public_key,
        alice.ctx.identity().signing().public_key().to_vec()
    );
}

#[tokio::test]
async fn test_wrong_pin_marks_request() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    let mut alice_events = alice.ctx.subscribe();

    let wrong = if bob.pin() == "1111111111" { "2222222222" } else { "1111111111" };
    let outgoing = alice
        .handshake
        .initiate(&bob.friend_request_address(), wrong)
        .await
        .expect("initiate");

    let request = alice.ctx.requests().get(outgoing).expect("get").expect("request");
    assert_eq!(request.status, RequestStatus::InvalidPin);
    assert_eq!(
        alice_events.recv().await.expect("event"),
        EngineEvent::Handshake {
            request_id: Some(outgoing),
            outcome: HandshakeOutcome::InvalidPin,
        }
    );
    assert!(bob.handshake.list_requests().expect("list").is_empty());

    // The PIN is inside the frame; only a fresh request can fix it.
    assert!(matches!(
        alice.handshake.resend(outgoing).await,
        Err(Error::InvalidPin)
    ));
}

#[tokio::test]
async fn test_repeat_request_keeps_one_row() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());

    let first = alice
        .handshake
        .initiate(&bob.friend_request_address(), &bob.pin())
        .await
        .expect("initiate");
    let second = alice
        .handshake
        .initiate(&bob.friend_request_address(), &bob.pin())
        .await
        .expect("initiate again");
    assert_eq!(first, second);
    assert_eq!(alice.handshake.list_requests().expect("list").len(), 1);
    assert_eq!(bob.handshake.list_requests().expect("list").len(), 1);
}

#[tokio::test]
async fn test_existing_contact_cannot_be_requested() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    befriend(&alice, &bob).await;

    assert!(matches!(
        alice
            .handshake
            .initiate(&bob.friend_request_address(), &bob.pin())
            .await,
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn test_rejected_request_creates_nothing() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());

    alice
        .handshake
        .initiate(&bob.friend_request_address(), &bob.pin())
        .await
        .expect("initiate");
    let incoming = bob.handshake.list_requests().expect("list")[0].id;
    bob.handshake.reject(incoming).expect("reject");

    assert!(bob.handshake.list_requests().expect("list").is_empty());
    assert!(bob.ctx.contacts().list().expect("list").is_empty());
    assert!(alice.ctx.contacts().list().expect("list").is_empty());
    assert!(matches!(
        bob.handshake.accept(incoming).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_removed_contact_can_be_requested_again() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", EngineConfig::default());
    let bob = Peer::join(&network, "bob", EngineConfig::default());
    let (bob_at_alice, _) = befriend(&alice, &bob).await;
    let mut events = alice.ctx.subscribe();

    alice.handshake.remove_contact(bob_at_alice).expect("remove");
    assert!(alice.ctx.contacts().get(bob_at_alice).expect("get").is_none());
    assert_eq!(alice.ctx.keychain().counters(bob_at_alice).expect("counters"), None);

    let mut changed = false;
    while let Ok(event) = events.try_recv() {
        changed |= event == EngineEvent::ContactChanged { contact_id: bob_at_alice };
    }
    assert!(changed);
    assert!(matches!(
        alice.handshake.remove_contact(bob_at_alice),
        Err(Error::NotFound(_))
    ));

    alice
        .handshake
        .initiate(&bob.friend_request_address(), &bob.pin())
        .await
        .expect("initiate again");
}

fn legacy() -> EngineConfig {
    EngineConfig {
        pin_mode: PinMode::Legacy,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_legacy_peer_handshake_and_message() {
    let network = LoopbackNetwork::new();
    let alice = Peer::join(&network, "alice", legacy());
    let bob = Peer::join(&network, "bob", legacy());
    assert_eq!(bob.pin().len(), 6);

    // Alice's own request stays queued; what reaches bob is an older
    // client's Phase 1, unsigned and without an ML-KEM key.
    network.set_reachable(&bob.friend_request_address(), false);
    alice
        .handshake
        .initiate(&bob.friend_request_address(), &bob.pin())
        .await
        .expect("initiate");
    network.set_reachable(&bob.friend_request_address(), true);

    let mut payload = Phase1Payload::new(alice.ctx.identity()).expect("payload");
    payload.kyber_public_key = None;
    payload.ed25519_public_key = None;
    payload.signature = None;
    let json = serde_json::to_vec(&payload).expect("json");
    let blob = encrypt_with_secret(&json, &bob.pin()).expect("encrypt");
    network
        .transport()
        .send(
            &bob.friend_request_address(),
            legacy().transport.friend_request_port,
            &Frame::new(WireType::FriendRequest, blob).to_bytes(),
        )
        .await
        .expect("legacy phase 1");

    let requests = bob.handshake.list_requests().expect("list");
    assert_eq!(requests.len(), 1);
    bob.handshake.accept(requests[0].id).await.expect("accept");

    let bob_at_alice = alice.contact_id(&bob);
    eventually("confirmation", || bob.try_contact_id(&alice).is_some()).await;
    let alice_at_bob = bob.contact_id(&alice);
    assert!(alice.handshake.list_requests().expect("list").is_empty());
    assert!(bob.handshake.list_requests().expect("list").is_empty());

    // Both sides derived the same chain from the classical agreement.
    let ping_id = alice
        .delivery
        .send_message(bob_at_alice, ContentType::Text, b"from an old client")
        .await
        .expect("send");
    eventually("message stored", || bob.has_message(&ping_id)).await;
    let stored = bob.ctx.messages().get_by_ping(&ping_id).expect("get").expect("message");
    assert_eq!(stored.body, b"from an old client");
    assert_eq!(stored.contact_id, alice_at_bob);
}
