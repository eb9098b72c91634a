//! Sending side: ping first, message once the peer pongs.

use super::{msg_key, ping_key, DeliveryMachine};
use crate::crypto::random_id;
use crate::error::{Error, Result};
use crate::logging::ShortId;
use crate::protocol::{
    AckBody, AckType, ContentType, Frame, MessageBody, PingBody, PongBody, SignedBody, WireType,
    MAX_FRAME_SIZE,
};
use crate::storage::{
    now, MessageStore, NewMessage, NewOutboxItem, Outbox, OutboxKind, OutboxStatus,
};
use crate::worker::{dispatch, FollowUps};
use tracing::debug;

/// Room left in a frame for the message body's framing and AEAD overhead.
const FRAME_OVERHEAD: usize = 512;

impl DeliveryMachine {
    /// Encrypt and queue a message, then announce it with a ping.
    ///
    /// The plaintext, the ping and the held message are persisted in one
    /// transaction before anything touches the network. Returns the ping id.
    pub async fn send_message(
        &self,
        contact_id: i64,
        content_type: ContentType,
        body: &[u8],
    ) -> Result<String> {
        if body.len() + FRAME_OVERHEAD > MAX_FRAME_SIZE {
            return Err(Error::Protocol("message too large".into()));
        }
        let contact = self.confirmed_contact(contact_id)?;
        let (counter, envelope) = self.ctx.keychain().encrypt_message(contact_id, body).await?;

        let ping_id = random_id();
        let identity = self.ctx.identity();
        let own = identity.addresses.messaging.to_string();
        let transport = &self.ctx.config().transport;

        let ping = PingBody {
            ping_id: ping_id.clone(),
            sender: own.clone(),
            recipient: contact.messaging_address.clone(),
            signature: Vec::new(),
        }
        .signed(identity.signing())?;
        let ping_frame = Frame::new(WireType::Ping, ping.encode(content_type)?);
        let message_frame = Frame::with_body(
            WireType::Message,
            &MessageBody {
                ping_id: ping_id.clone(),
                sender: own,
                content_type: content_type as u8,
                envelope,
            },
        )?;

        let ping_item = NewOutboxItem {
            kind: OutboxKind::Ping,
            dedupe_key: ping_key(&ping_id),
            address: contact.messaging_address.clone(),
            port: WireType::Ping.port(transport),
            frame: ping_frame.to_bytes(),
            request_id: None,
            contact_id: Some(contact_id),
            held: false,
        };
        let message_item = NewOutboxItem {
            kind: OutboxKind::Message,
            dedupe_key: msg_key(&ping_id),
            port: WireType::Message.port(transport),
            frame: message_frame.to_bytes(),
            held: true,
            ..ping_item.clone()
        };

        let at = now();
        let ping_item_id = self.ctx.db().transaction(|tx| {
            MessageStore::insert_with(
                tx,
                &NewMessage {
                    contact_id,
                    ping_id: &ping_id,
                    outgoing: true,
                    content_type: content_type as u8,
                    body,
                },
                at,
            )?;
            Outbox::enqueue_with(tx, &message_item, at)?;
            Outbox::enqueue_with(tx, &ping_item, at)
        })?;
        debug!(contact_id, counter, ping = %ShortId(&ping_id), "message queued");

        dispatch(&self.ctx, ping_item_id).await?;
        Ok(ping_id)
    }

    /// Re-announce a message whose ping ran out of attempts.
    pub async fn resend_message(&self, ping_id: &str) -> Result<bool> {
        let outbox = self.ctx.outbox();
        let ping = outbox
            .get_by_key(&ping_key(ping_id))?
            .ok_or_else(|| Error::NotFound(format!("ping {}", ping_id)))?;
        let at = now();

        if let Some(message) = outbox.get_by_key(&msg_key(ping_id))? {
            if message.status == OutboxStatus::Failed {
                outbox.enqueue(&requeue(&message, true), at)?;
            }
        }
        let id = outbox.enqueue(&requeue(&ping, false), at)?;
        dispatch(&self.ctx, id).await
    }

    /// The peer is ready for a message: release (or re-arm) it. The
    /// message itself goes out as a follow-up.
    pub(crate) fn handle_pong(&self, frame: &Frame) -> Result<FollowUps> {
        let pong: PongBody = frame.decode_body()?;
        let mut followups = FollowUps::default();
        let Some(contact) = self.authenticate(&pong)? else {
            return Ok(followups);
        };
        let outbox = self.ctx.outbox();
        let at = now();

        let message = outbox
            .get_by_key(&msg_key(&pong.ping_id))?
            .ok_or_else(|| Error::NotFound(format!("message for ping {}", ShortId(&pong.ping_id))))?;
        if message.contact_id != Some(contact.id) {
            return Err(Error::Protocol("pong for another contact's message".into()));
        }
        // A pong implies the ping arrived.
        outbox.mark_delivered_by_key(&ping_key(&pong.ping_id), at)?;

        let id = match message.status {
            OutboxStatus::Held => {
                outbox.release(&message.dedupe_key, at)?;
                message.id
            }
            // The peer lost the first copy and asked again.
            OutboxStatus::Delivered | OutboxStatus::Failed => {
                outbox.enqueue(&requeue(&message, false), at)?
            }
            OutboxStatus::Pending | OutboxStatus::Sending => message.id,
        };
        debug!(contact_id = contact.id, ping = %ShortId(&pong.ping_id), "pong received");
        followups.send(id);
        Ok(followups)
    }

    /// Ping and message acknowledgements stop our resends. Only the
    /// contact an item was sent to may acknowledge it.
    pub(crate) fn handle_ack(&self, ack: &AckBody) -> Result<()> {
        let key = match ack.ack_type {
            AckType::PingAck => ping_key(&ack.id),
            AckType::MessageAck => msg_key(&ack.id),
            AckType::HandshakeConfirm => {
                return Err(Error::Protocol("handshake confirmation on delivery path".into()))
            }
        };
        let Some(contact) = self.authenticate(ack)? else {
            return Ok(());
        };
        let outbox = self.ctx.outbox();
        let Some(item) = outbox.get_by_key(&key)? else {
            debug!(contact_id = contact.id, ping = %ShortId(&ack.id), "ack for unknown item");
            return Ok(());
        };
        if item.contact_id != Some(contact.id) {
            return Err(Error::Protocol("ack for another contact's message".into()));
        }
        let changed = outbox.mark_delivered_by_key(&key, now())?;
        debug!(
            contact_id = contact.id,
            ack = ?ack.ack_type,
            ping = %ShortId(&ack.id),
            changed,
            "ack received"
        );
        Ok(())
    }
}

fn requeue(item: &crate::storage::OutboxItem, held: bool) -> NewOutboxItem {
    NewOutboxItem {
        kind: item.kind,
        dedupe_key: item.dedupe_key.clone(),
        address: item.address.clone(),
        port: item.port,
        frame: item.frame.clone(),
        request_id: item.request_id,
        contact_id: item.contact_id,
        held,
    }
}
