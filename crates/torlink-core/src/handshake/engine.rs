//! Handshake state transitions.

use super::payload::{
    ConfirmPayload, ContactCard, Phase1Payload, Phase2Payload, RequestMaterial, SignatureCheck,
    Signed,
};
use crate::context::EngineContext;
use crate::crypto::{
    classical_agreement, decrypt_with_secret, encrypt_with_secret, hybrid_decapsulate,
    hybrid_encapsulate, open_sealed, seal_to, SharedSecret, X25519PublicKey,
};
use crate::delivery::DeliveryMachine;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, HandshakeOutcome};
use crate::identity::OnionAddress;
use crate::keychain::KeyChainManager;
use crate::logging::RedactedOnion;
use crate::protocol::{AckBody, AckType, Frame, WireType};
use crate::storage::{
    now, ContactStore, FriendshipStatus, NewContact, NewOutboxItem, Outbox, OutboxKind,
    PendingFriendRequest, RequestDirection, RequestStatus, RequestStore,
};
use crate::worker::{dispatch, FollowUps};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Drives friend requests from initiation to a confirmed contact.
#[derive(Debug, Clone)]
pub struct HandshakeEngine {
    ctx: EngineContext,
}

fn request_key(request_id: i64) -> String {
    format!("fr:{}", request_id)
}

impl HandshakeEngine {
    /// Engine over `ctx`.
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Phase 1: send our keys to `address`, encrypted under the peer's PIN.
    ///
    /// The request and its outbox item are persisted before the first send
    /// attempt. Returns the outgoing request id.
    pub async fn initiate(&self, address: &str, pin: &str) -> Result<i64> {
        let peer = OnionAddress::parse(address)?;
        self.ctx.config().pin_mode.validate_pin(pin)?;
        let identity = self.ctx.identity();
        if peer == identity.addresses.friend_request {
            return Err(Error::Protocol("cannot send a friend request to yourself".into()));
        }
        if self.ctx.contacts().get_by_address(peer.as_str())?.is_some() {
            return Err(Error::Protocol("peer is already a contact".into()));
        }

        let payload = Phase1Payload::new(identity)?;
        let json = Zeroizing::new(serde_json::to_vec(&payload)?);
        let blob = encrypt_with_secret(&json, pin)?;
        let frame = Frame::new(WireType::FriendRequest, blob).to_bytes();
        let material = RequestMaterial::Phase1Sent {
            frame: frame.clone(),
        }
        .encode()?;

        let (request_id, item_id) = self.ctx.db().transaction(|tx| {
            let request_id = RequestStore::upsert_with(
                tx,
                RequestDirection::Outgoing,
                peer.as_str(),
                RequestStatus::Sending,
                &material,
            )?;
            let item = self.handshake_item(request_id, peer.as_str(), WireType::FriendRequest, frame);
            Ok((request_id, Outbox::enqueue_with(tx, &item, now())?))
        })?;
        info!(request_id, peer = %RedactedOnion(peer.as_str()), "friend request queued");

        dispatch(&self.ctx, item_id).await?;
        Ok(request_id)
    }

    /// Handle an incoming Phase-1 blob, decrypting it with our own PIN.
    ///
    /// Returns the incoming request id, or `None` if the sender is already
    /// a contact.
    pub fn receive_phase1(&self, blob: &[u8]) -> Result<Option<i64>> {
        let identity = self.ctx.identity();
        let json = match decrypt_with_secret(blob, identity.pin()) {
            Ok(json) => json,
            Err(Error::InvalidPin) => {
                warn!("friend request could not be opened with our PIN");
                self.outcome(None, HandshakeOutcome::InvalidPin);
                return Err(Error::InvalidPin);
            }
            Err(e) => return Err(e),
        };
        let payload = Phase1Payload::parse(&json)?;
        match payload.check_signature() {
            Ok(SignatureCheck::Verified) => {}
            Ok(SignatureCheck::Unsigned) => {
                warn!("unsigned friend request, continuing with reduced trust")
            }
            Err(Error::SignatureInvalid) => {
                warn!("friend request signature invalid, possible MITM");
                self.outcome(None, HandshakeOutcome::SignatureInvalid);
                return Err(Error::SignatureInvalid);
            }
            Err(e) => return Err(e),
        }

        let peer = OnionAddress::parse(&payload.friend_request_address)?;
        if peer == identity.addresses.friend_request {
            return Err(Error::Protocol("friend request from ourselves".into()));
        }
        if self.ctx.contacts().get_by_address(peer.as_str())?.is_some() {
            debug!(peer = %RedactedOnion(peer.as_str()), "friend request from existing contact discarded");
            return Ok(None);
        }

        let material = RequestMaterial::Phase1Received {
            payload: json.to_vec(),
        }
        .encode()?;
        let request_id = self.ctx.requests().upsert(
            RequestDirection::Incoming,
            peer.as_str(),
            RequestStatus::Pending,
            &material,
        )?;
        info!(request_id, peer = %RedactedOnion(peer.as_str()), "friend request received");
        self.ctx.emit(EngineEvent::RequestReceived { request_id });
        Ok(Some(request_id))
    }

    /// Phase 2: accept an incoming request.
    ///
    /// Encapsulates a fresh secret to the initiator's keys, keeps it with a
    /// new outgoing request, and removes the incoming one. The contact is
    /// created only when the initiator confirms. Returns the outgoing
    /// request id.
    pub async fn accept(&self, request_id: i64) -> Result<i64> {
        let request = self.request(request_id)?;
        if request.direction != RequestDirection::Incoming
            || request.status != RequestStatus::Pending
        {
            return Err(Error::Protocol(format!(
                "request {} is not awaiting acceptance",
                request_id
            )));
        }
        let RequestMaterial::Phase1Received { payload: json } =
            RequestMaterial::decode(&request.payload)?
        else {
            return Err(Error::UnsupportedFormat);
        };
        let peer = Phase1Payload::parse(&json)?;
        peer.check_signature()?;

        let identity = self.ctx.identity();
        let peer_x25519 = X25519PublicKey::from_slice(&peer.x25519()?)?;
        let (secret, kyber_ciphertext) = match peer.kyber()? {
            Some(kyber) => {
                let (secret, ciphertext) = hybrid_encapsulate(&peer_x25519, &kyber)?;
                (secret, Some(hex::encode(ciphertext)))
            }
            None => {
                debug!(request_id, "peer has no ML-KEM key, using classical agreement");
                (classical_agreement(identity.x25519(), &peer_x25519)?, None)
            }
        };

        let mut phase2 = Phase2Payload {
            contact_card: ContactCard::from_identity(identity),
            kyber_ciphertext,
            phase: Phase2Payload::PHASE,
            ed25519_public_key: hex::encode(identity.signing().public_key()),
            signature: None,
        };
        phase2.sign(identity.signing())?;
        let sealed = seal_to(&peer_x25519, &serde_json::to_vec(&phase2)?)?;
        let frame = Frame::new(WireType::FriendRequestAccepted, sealed).to_bytes();
        let material = RequestMaterial::Phase2Sent {
            frame: frame.clone(),
            shared_secret: secret.as_bytes().to_vec(),
            peer: json,
        }
        .encode()?;

        let address = request.peer_address.as_str();
        let (outgoing_id, item_id) = self.ctx.db().transaction(|tx| {
            // A concurrent accept or reject already consumed it.
            if !RequestStore::delete_with(tx, request_id)? {
                return Err(Error::NotFound(format!("request {}", request_id)));
            }
            let outgoing_id = RequestStore::upsert_with(
                tx,
                RequestDirection::Outgoing,
                address,
                RequestStatus::Sending,
                &material,
            )?;
            let item =
                self.handshake_item(outgoing_id, address, WireType::FriendRequestAccepted, frame);
            Ok((outgoing_id, Outbox::enqueue_with(tx, &item, now())?))
        })?;
        info!(request_id, outgoing_id, peer = %RedactedOnion(address), "friend request accepted");

        dispatch(&self.ctx, item_id).await?;
        Ok(outgoing_id)
    }

    /// Handle the acceptor's Phase-2 blob: create the contact, seed its key
    /// chain and send the confirmation.
    ///
    /// A bad signature changes nothing. Returns the new contact id, or
    /// `None` for a late result with nothing left to complete.
    pub async fn receive_phase2(&self, blob: &[u8]) -> Result<Option<i64>> {
        let (contact_id, followups) = self.accept_phase2(blob)?;
        followups.run(&self.ctx).await?;
        Ok(contact_id)
    }

    /// Everything [`receive_phase2`](Self::receive_phase2) does except
    /// sending: the confirmation is persisted and returned as a follow-up.
    pub(crate) fn accept_phase2(&self, blob: &[u8]) -> Result<(Option<i64>, FollowUps)> {
        let identity = self.ctx.identity();
        let json = open_sealed(identity.x25519(), blob)?;
        let payload = match Phase2Payload::parse(&json) {
            Err(Error::SignatureInvalid) => {
                warn!("friend request acceptance signature invalid, possible MITM");
                self.outcome(None, HandshakeOutcome::SignatureInvalid);
                return Err(Error::SignatureInvalid);
            }
            other => other?,
        };
        let contact = payload.contact_card.to_contact(FriendshipStatus::Confirmed)?;
        let address = contact.friend_request_address.as_str();

        let Some(request) = self.ctx.requests().find(RequestDirection::Outgoing, address)? else {
            debug!(peer = %RedactedOnion(address), "acceptance without a pending request discarded");
            return Ok((None, FollowUps::default()));
        };
        if !matches!(
            RequestMaterial::decode(&request.payload)?,
            RequestMaterial::Phase1Sent { .. }
        ) || request.status == RequestStatus::Accepted
            || self.ctx.contacts().get_by_address(address)?.is_some()
        {
            debug!(request_id = request.id, "late acceptance discarded");
            return Ok((None, FollowUps::default()));
        }

        let peer_x25519 = X25519PublicKey::from_slice(&contact.x25519_public_key)?;
        let secret = match payload.kyber_ciphertext()? {
            Some(ciphertext) => hybrid_decapsulate(identity.x25519(), identity.mlkem(), &ciphertext)?,
            None => classical_agreement(identity.x25519(), &peer_x25519)?,
        };

        let confirm = ConfirmPayload::new(identity)?;
        let frame = Frame::with_body(
            WireType::Ack,
            &AckBody {
                ack_type: AckType::HandshakeConfirm,
                id: String::new(),
                sender: identity.addresses.messaging.to_string(),
                recipient: contact.messaging_address.clone(),
                signature: Vec::new(),
                blob: Some(seal_to(&peer_x25519, &serde_json::to_vec(&confirm)?)?),
            },
        )?
        .to_bytes();

        let (contact_id, item_id) = self.ctx.db().transaction(|tx| {
            let contact_id = self.complete_with(tx, &request, &contact, &secret)?;
            let item = NewOutboxItem {
                kind: OutboxKind::Ack,
                dedupe_key: format!("ack:confirm:{}", contact_id),
                address: contact.messaging_address.clone(),
                port: WireType::Ack.port(&self.ctx.config().transport),
                frame,
                request_id: None,
                contact_id: Some(contact_id),
                held: false,
            };
            Ok((contact_id, Outbox::enqueue_with(tx, &item, now())?))
        })?;
        self.finish(&request, contact_id)?;

        let mut followups = FollowUps::default();
        followups.send(item_id);
        Ok((Some(contact_id), followups))
    }

    /// Handle the initiator's confirmation: create the contact and seed its
    /// key chain from the secret kept since Phase 2.
    pub fn receive_confirm(&self, ack: &AckBody) -> Result<Option<i64>> {
        let blob = ack
            .blob
            .as_deref()
            .ok_or_else(|| Error::Protocol("confirmation without payload".into()))?;
        let json = open_sealed(self.ctx.identity().x25519(), blob)?;
        let payload = match ConfirmPayload::parse(&json) {
            Err(Error::SignatureInvalid) => {
                warn!("handshake confirmation signature invalid");
                self.outcome(None, HandshakeOutcome::SignatureInvalid);
                return Err(Error::SignatureInvalid);
            }
            other => other?,
        };
        let card = &payload.contact_card;
        let contact = card.to_contact(FriendshipStatus::Confirmed)?;
        let address = contact.friend_request_address.as_str();

        let Some(request) = self.ctx.requests().find(RequestDirection::Outgoing, address)? else {
            debug!(peer = %RedactedOnion(address), "confirmation without a pending request discarded");
            return Ok(None);
        };
        let RequestMaterial::Phase2Sent {
            shared_secret, peer, ..
        } = RequestMaterial::decode(&request.payload)?
        else {
            debug!(request_id = request.id, "confirmation for a request we never accepted");
            return Ok(None);
        };
        let secret = SharedSecret::from_bytes(shared_secret);

        // The confirmation must come from the keys that sent Phase 1.
        let phase1 = Phase1Payload::parse(&peer)?;
        let signer_changed = phase1
            .ed25519_public_key
            .as_deref()
            .is_some_and(|key| key != card.ed25519_public_key);
        if signer_changed || phase1.x25519_public_key != card.x25519_public_key {
            warn!(request_id = request.id, "confirmation keys differ from the friend request");
            self.outcome(Some(request.id), HandshakeOutcome::SignatureInvalid);
            return Err(Error::SignatureInvalid);
        }
        if self.ctx.contacts().get_by_address(address)?.is_some() {
            debug!(request_id = request.id, "late confirmation discarded");
            return Ok(None);
        }

        let contact_id = self
            .ctx
            .db()
            .transaction(|tx| self.complete_with(tx, &request, &contact, &secret))?;
        self.finish(&request, contact_id)?;
        Ok(Some(contact_id))
    }

    /// Every request after stale SENDING rows have been demoted.
    pub fn list_requests(&self) -> Result<Vec<PendingFriendRequest>> {
        Ok(self.load()?.0)
    }

    /// Demote stale SENDING requests and fail their outbox items. Returns
    /// the demoted ids.
    pub fn demote_stale(&self) -> Result<Vec<i64>> {
        Ok(self.load()?.1)
    }

    /// Queue the stored frame of an outgoing request again.
    ///
    /// Returns whether the immediate attempt delivered it.
    pub async fn resend(&self, request_id: i64) -> Result<bool> {
        let request = self.request(request_id)?;
        match (request.direction, request.status) {
            (RequestDirection::Incoming, _) => {
                return Err(Error::Protocol("incoming requests cannot be resent".into()))
            }
            (_, RequestStatus::Accepted) => {
                return Err(Error::Protocol(format!("request {} already accepted", request_id)))
            }
            // The PIN is baked into the frame; a new request is needed.
            (_, RequestStatus::InvalidPin) => return Err(Error::InvalidPin),
            _ => {}
        }
        let material = RequestMaterial::decode(&request.payload)?;
        let frame = material.frame().ok_or(Error::UnsupportedFormat)?;
        let wire_type = Frame::from_bytes(frame)?.wire_type;

        let item_id = self.ctx.db().transaction(|tx| {
            RequestStore::transition_with(
                tx,
                request_id,
                &[
                    RequestStatus::Sending,
                    RequestStatus::Pending,
                    RequestStatus::Failed,
                ],
                RequestStatus::Sending,
            )?;
            let item =
                self.handshake_item(request_id, &request.peer_address, wire_type, frame.to_vec());
            Outbox::enqueue_with(tx, &item, now())
        })?;
        info!(request_id, "friend request resent");
        dispatch(&self.ctx, item_id).await
    }

    /// Decline an incoming request. Nothing is sent to the peer.
    pub fn reject(&self, request_id: i64) -> Result<()> {
        let request = self.request(request_id)?;
        if request.direction != RequestDirection::Incoming {
            return Err(Error::Protocol("only incoming requests can be rejected".into()));
        }
        if !self.ctx.requests().delete(request_id)? {
            return Err(Error::NotFound(format!("request {}", request_id)));
        }
        info!(request_id, "friend request rejected");
        self.outcome(Some(request_id), HandshakeOutcome::Rejected);
        Ok(())
    }

    /// Mark a contact as verified out of band.
    pub fn set_trusted(&self, contact_id: i64, trusted: bool) -> Result<()> {
        self.ctx.contacts().set_trusted(contact_id, trusted)?;
        self.ctx.emit(EngineEvent::ContactChanged { contact_id });
        Ok(())
    }

    /// Block or unblock a contact. Frames from a blocked contact are
    /// dropped unanswered.
    pub fn set_blocked(&self, contact_id: i64, blocked: bool) -> Result<()> {
        self.ctx.contacts().set_blocked(contact_id, blocked)?;
        info!(contact_id, blocked, "contact block flag changed");
        self.ctx.emit(EngineEvent::ContactChanged { contact_id });
        Ok(())
    }

    /// Delete a contact with its key chain, inbox, messages and queued
    /// frames.
    pub fn remove_contact(&self, contact_id: i64) -> Result<()> {
        DeliveryMachine::new(self.ctx.clone()).purge_contact(contact_id)?;
        if !self.ctx.contacts().delete(contact_id)? {
            return Err(Error::NotFound(format!("contact {}", contact_id)));
        }
        info!(contact_id, "contact removed");
        self.ctx.emit(EngineEvent::ContactChanged { contact_id });
        Ok(())
    }

    fn load(&self) -> Result<(Vec<PendingFriendRequest>, Vec<i64>)> {
        let at = now();
        let (requests, demoted) = self
            .ctx
            .requests()
            .load_all(at, self.ctx.config().stale_request_secs)?;
        for &request_id in &demoted {
            self.ctx.outbox().fail_for_request(request_id, at)?;
            warn!(request_id, "friend request went stale");
            self.outcome(Some(request_id), HandshakeOutcome::Stale);
        }
        Ok((requests, demoted))
    }

    /// Insert the contact, seed its chains and retire the request.
    fn complete_with(
        &self,
        tx: &rusqlite::Connection,
        request: &PendingFriendRequest,
        contact: &NewContact,
        secret: &SharedSecret,
    ) -> Result<i64> {
        let contact_id = ContactStore::insert_with(tx, contact)?;
        KeyChainManager::initialize_with(
            tx,
            contact_id,
            secret.as_bytes(),
            self.ctx.identity().addresses.messaging.as_str(),
            &contact.messaging_address,
        )?;
        RequestStore::transition_with(
            tx,
            request.id,
            &[
                RequestStatus::Sending,
                RequestStatus::Pending,
                RequestStatus::Failed,
            ],
            RequestStatus::Accepted,
        )?;
        RequestStore::delete_with(tx, request.id)?;
        Ok(contact_id)
    }

    fn finish(&self, request: &PendingFriendRequest, contact_id: i64) -> Result<()> {
        // The peer answered, so our last handshake frame evidently arrived.
        self.ctx
            .outbox()
            .mark_delivered_by_key(&request_key(request.id), now())?;
        info!(contact_id, request_id = request.id, "contact confirmed");
        self.ctx.emit(EngineEvent::ContactChanged { contact_id });
        self.outcome(Some(request.id), HandshakeOutcome::Accepted);
        Ok(())
    }

    fn handshake_item(
        &self,
        request_id: i64,
        address: &str,
        wire_type: WireType,
        frame: Vec<u8>,
    ) -> NewOutboxItem {
        NewOutboxItem {
            kind: OutboxKind::Handshake,
            dedupe_key: request_key(request_id),
            address: address.to_string(),
            port: wire_type.port(&self.ctx.config().transport),
            frame,
            request_id: Some(request_id),
            contact_id: None,
            held: false,
        }
    }

    fn request(&self, request_id: i64) -> Result<PendingFriendRequest> {
        self.ctx
            .requests()
            .get(request_id)?
            .ok_or_else(|| Error::NotFound(format!("request {}", request_id)))
    }

    fn outcome(&self, request_id: Option<i64>, outcome: HandshakeOutcome) {
        self.ctx.emit(EngineEvent::Handshake { request_id, outcome });
    }
}
