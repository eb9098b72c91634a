//! Receiving side: record pings, fetch with pongs, store messages.
//!
//! Handlers for inbound frames only persist. Replies (acks, pongs) are
//! queued into [`FollowUps`] and sent after the frame has been answered.

use super::{pong_key, DeliveryMachine};
use crate::config::DownloadMode;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::logging::ShortId;
use crate::protocol::{
    AckBody, AckType, ContentType, Frame, MessageBody, PingBody, PongBody, SignedBody, WireType,
};
use crate::storage::{
    now, Contact, InboxStore, MessageStore, NewMessage, NewOutboxItem, OutboxKind, PingInboxEntry,
    PingState,
};
use crate::worker::FollowUps;
use tracing::{debug, info, warn};

impl DeliveryMachine {
    /// Record an incoming ping and, depending on the download mode, start
    /// fetching its message.
    ///
    /// Returns the inbox entry id, or `None` if the message was already
    /// stored. Every ping is acknowledged, duplicates included, so the
    /// sender stops resending it.
    pub async fn record_ping(
        &self,
        contact_id: i64,
        ping_id: &str,
        wire_bytes: &[u8],
    ) -> Result<Option<i64>> {
        let mut followups = FollowUps::default();
        let entry_id = self.accept_ping(contact_id, ping_id, wire_bytes, &mut followups)?;
        followups.run(&self.ctx).await?;
        Ok(entry_id)
    }

    /// Persist a ping and queue its ack and, when fetching, its pong.
    fn accept_ping(
        &self,
        contact_id: i64,
        ping_id: &str,
        wire_bytes: &[u8],
        followups: &mut FollowUps,
    ) -> Result<Option<i64>> {
        let (content_type, _) = PingBody::decode(wire_bytes)?;
        let contact = self.confirmed_contact(contact_id)?;

        if self.ctx.messages().get_by_ping(ping_id)?.is_some() {
            self.reconcile_ghosts()?;
            self.queue_ack(&contact, AckType::PingAck, ping_id, followups)?;
            return Ok(None);
        }

        let at = now();
        let (entry_id, inserted) = self.ctx.inbox().insert(
            contact_id,
            ping_id,
            content_type,
            wire_bytes,
            PingState::PingSeen,
            at,
        )?;
        if !inserted {
            let entry = self.entry(entry_id)?;
            if entry.contact_id != contact_id {
                return Err(Error::Protocol("ping id already used by another contact".into()));
            }
            debug!(entry_id, ping = %ShortId(ping_id), "duplicate ping");
            self.queue_ack(&contact, AckType::PingAck, ping_id, followups)?;
            return Ok(Some(entry_id));
        }
        debug!(contact_id, entry_id, ping = %ShortId(ping_id), ?content_type, "ping recorded");
        self.queue_ack(&contact, AckType::PingAck, ping_id, followups)?;

        let fetch = match self.ctx.config().download_mode {
            DownloadMode::Auto => true,
            DownloadMode::Manual => self.ctx.auto_pong(contact_id)?,
        };
        if fetch {
            match self.claim(entry_id) {
                Ok(()) => self.queue_pong(entry_id, followups)?,
                Err(e) if e.is_locally_recovered() => {}
                Err(e) => return Err(e),
            }
        } else {
            self.ctx
                .inbox()
                .transition(entry_id, &[PingState::PingSeen], PingState::ManualRequired, now())?;
            self.publish(contact_id)?;
        }
        Ok(Some(entry_id))
    }

    /// Send the pong for a claimed entry.
    ///
    /// The entry must be DOWNLOAD_QUEUED, i.e. claimed by the caller. If the
    /// pong cannot be delivered the entry goes to FAILED_TEMP.
    pub async fn begin_download(&self, entry_id: i64) -> Result<()> {
        let mut followups = FollowUps::default();
        self.queue_pong(entry_id, &mut followups)?;
        followups.run(&self.ctx).await
    }

    /// Move a claimed entry to DOWNLOADING and queue its signed pong.
    fn queue_pong(&self, entry_id: i64, followups: &mut FollowUps) -> Result<()> {
        let entry = self.entry(entry_id)?;
        if !self.ctx.inbox().transition(
            entry_id,
            &[PingState::DownloadQueued],
            PingState::Downloading,
            now(),
        )? {
            return Err(Error::ClaimConflict(entry_id));
        }
        self.publish(entry.contact_id)?;

        let contact = self.confirmed_contact(entry.contact_id)?;
        let identity = self.ctx.identity();
        let pong = PongBody {
            ping_id: entry.ping_id.clone(),
            sender: identity.addresses.messaging.to_string(),
            recipient: contact.messaging_address.clone(),
            signature: Vec::new(),
        }
        .signed(identity.signing())?;
        let item = NewOutboxItem {
            kind: OutboxKind::Pong,
            dedupe_key: pong_key(&entry.ping_id),
            address: contact.messaging_address.clone(),
            port: WireType::Pong.port(&self.ctx.config().transport),
            frame: Frame::with_body(WireType::Pong, &pong)?.to_bytes(),
            request_id: None,
            contact_id: Some(contact.id),
            held: false,
        };
        let item_id = self.ctx.outbox().enqueue(&item, now())?;
        followups.pong(entry_id, item_id);
        Ok(())
    }

    /// Store the plaintext for an entry and retire the entry, atomically.
    ///
    /// Returns false if the message was already stored.
    pub fn complete_download(&self, entry_id: i64, plaintext: &[u8]) -> Result<bool> {
        let at = now();
        let (entry, inserted) = self.ctx.db().transaction(|tx| {
            let entry = InboxStore::get_with(tx, entry_id)?
                .ok_or_else(|| Error::NotFound(format!("inbox entry {}", entry_id)))?;
            let inserted = MessageStore::insert_with(
                tx,
                &NewMessage {
                    contact_id: entry.contact_id,
                    ping_id: &entry.ping_id,
                    outgoing: false,
                    content_type: entry.content_type as u8,
                    body: plaintext,
                },
                at,
            )?;
            InboxStore::set_stored_with(tx, entry_id, at)?;
            InboxStore::delete_with(tx, entry_id)?;
            Ok((entry, inserted))
        })?;

        if inserted {
            info!(contact_id = entry.contact_id, ping = %ShortId(&entry.ping_id), "message stored");
            self.ctx.emit(EngineEvent::MessageReceived {
                contact_id: entry.contact_id,
                ping_id: entry.ping_id.clone(),
                silent: entry.is_silent(),
            });
        }
        self.publish(entry.contact_id)?;
        Ok(inserted)
    }

    /// The user tapped a locked entry. Claims it, fetches it, and
    /// auto-pongs the contact's later pings for the rest of the session.
    pub async fn manual_download(&self, entry_id: i64) -> Result<()> {
        self.claim(entry_id)?;
        let entry = self.entry(entry_id)?;
        self.ctx.enable_auto_pong(entry.contact_id)?;
        self.begin_download(entry_id).await
    }

    /// Re-attempt a FAILED_TEMP entry.
    pub async fn retry_download(&self, entry_id: i64) -> Result<()> {
        self.claim(entry_id)?;
        self.begin_download(entry_id).await
    }

    pub(crate) fn handle_ping(&self, frame: &Frame) -> Result<FollowUps> {
        let (_, ping) = PingBody::decode(&frame.body)?;
        let mut followups = FollowUps::default();
        let Some(contact) = self.authenticate(&ping)? else {
            return Ok(followups);
        };
        self.accept_ping(contact.id, &ping.ping_id, &frame.body, &mut followups)?;
        Ok(followups)
    }

    pub(crate) async fn handle_message(&self, frame: &Frame) -> Result<FollowUps> {
        let body: MessageBody = frame.decode_body()?;
        let mut followups = FollowUps::default();
        let Some(contact) = self.sender(&body.sender)? else {
            return Ok(followups);
        };

        let Some(entry) = self.ctx.inbox().get_by_ping(&body.ping_id)? else {
            if self.already_stored(&contact, &body.ping_id)? {
                // Our ack was lost; repeat it.
                self.queue_ack(&contact, AckType::MessageAck, &body.ping_id, &mut followups)?;
                return Ok(followups);
            }
            return Err(Error::Protocol("message without a recorded ping".into()));
        };
        if entry.contact_id != contact.id {
            return Err(Error::Protocol("message for another contact's ping".into()));
        }
        if !matches!(
            entry.state,
            PingState::DownloadQueued | PingState::Downloading | PingState::FailedTemp
        ) {
            return Err(Error::Protocol("message was not requested".into()));
        }
        if ContentType::from_byte(body.content_type)? != entry.content_type {
            return Err(Error::Protocol("content type differs from ping".into()));
        }

        match self.ctx.keychain().decrypt_message(contact.id, &body.envelope).await {
            Ok(plaintext) => {
                self.complete_download(entry.id, &plaintext)?;
            }
            Err(Error::UndecryptableMessage { counter }) => {
                // A concurrent copy of the same message may have won.
                if !self.already_stored(&contact, &body.ping_id)? {
                    self.discard(&entry)?;
                    warn!(contact_id = contact.id, counter, "message cannot be decrypted");
                    self.ctx.emit(EngineEvent::MessageUndecryptable {
                        contact_id: contact.id,
                        counter,
                    });
                }
            }
            Err(e) => {
                self.fail_download(entry.id)?;
                return Err(e);
            }
        }
        self.queue_ack(&contact, AckType::MessageAck, &body.ping_id, &mut followups)?;
        Ok(followups)
    }

    fn already_stored(&self, contact: &Contact, ping_id: &str) -> Result<bool> {
        Ok(self
            .ctx
            .messages()
            .get_by_ping(ping_id)?
            .is_some_and(|m| m.contact_id == contact.id && !m.outgoing))
    }

    /// Drop an entry whose message can never be opened.
    fn discard(&self, entry: &PingInboxEntry) -> Result<()> {
        self.ctx
            .db()
            .transaction(|tx| InboxStore::delete_with(tx, entry.id))?;
        self.publish(entry.contact_id)
    }

    fn queue_ack(
        &self,
        contact: &Contact,
        ack_type: AckType,
        ping_id: &str,
        followups: &mut FollowUps,
    ) -> Result<()> {
        let prefix = match ack_type {
            AckType::PingAck => "ack:ping",
            AckType::MessageAck => "ack:msg",
            AckType::HandshakeConfirm => "ack:confirm",
        };
        let identity = self.ctx.identity();
        let ack = AckBody {
            ack_type,
            id: ping_id.to_string(),
            sender: identity.addresses.messaging.to_string(),
            recipient: contact.messaging_address.clone(),
            signature: Vec::new(),
            blob: None,
        }
        .signed(identity.signing())?;
        let item = NewOutboxItem {
            kind: OutboxKind::Ack,
            dedupe_key: format!("{}:{}", prefix, ping_id),
            address: contact.messaging_address.clone(),
            port: WireType::Ack.port(&self.ctx.config().transport),
            frame: Frame::with_body(WireType::Ack, &ack)?.to_bytes(),
            request_id: None,
            contact_id: Some(contact.id),
            held: false,
        };
        followups.send(self.ctx.outbox().enqueue(&item, now())?);
        Ok(())
    }
}
