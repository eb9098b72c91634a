//! Ping/pong delivery.
//!
//! A sender never pushes ciphertext unannounced. It sends a small ping,
//! the receiver decides whether to fetch (automatically, or after a tap in
//! manual mode) and answers with a pong, and only then does the sender
//! release the message:
//!
//! ```text
//! Sender                                 Receiver
//!   │── Ping(ping_id) ──────────────────▶│  PING_SEEN
//!   │◀───────────────────────── PingAck ─│
//!   │                                    │  claim: DOWNLOAD_QUEUED
//!   │◀──────────────────────────── Pong ─│  DOWNLOADING
//!   │── Message(envelope) ──────────────▶│  MSG_STORED, entry deleted
//!   │◀────────────────────── MessageAck ─│
//! ```
//!
//! Per contact the entries collapse into one [`ContactDeliveryState`] that
//! decides what the UI shows.

mod receive;
mod send;

use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::logging::RedactedOnion;
use crate::protocol::SignedBody;
use crate::storage::{now, Contact, FriendshipStatus, PingInboxEntry, PingState};
use serde::Serialize;
use tracing::{debug, warn};

/// Aggregate delivery state of one contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContactDeliveryState {
    /// Nothing pending that the user needs to see.
    Idle,
    /// A fetch is in flight.
    Downloading,
    /// Manual mode: pings wait for the user.
    Paused,
    /// A fetch failed and will be retried silently.
    Backoff,
}

/// What the conversation view should show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Indicator {
    /// Nothing.
    None,
    /// A live "typing" indicator for the oldest visible download.
    Typing {
        /// Entry the indicator stands for.
        entry_id: i64,
    },
    /// One lock affordance per entry waiting for a manual download.
    Locked {
        /// Entries waiting for the user, oldest first.
        entry_ids: Vec<i64>,
    },
}

/// Collapse a contact's entries into its aggregate state.
pub fn aggregate(entries: &[PingInboxEntry]) -> ContactDeliveryState {
    let any = |states: &[PingState]| entries.iter().any(|e| states.contains(&e.state));
    if any(&[PingState::DownloadQueued, PingState::Downloading]) {
        ContactDeliveryState::Downloading
    } else if any(&[PingState::ManualRequired]) {
        ContactDeliveryState::Paused
    } else if any(&[PingState::FailedTemp]) {
        ContactDeliveryState::Backoff
    } else {
        ContactDeliveryState::Idle
    }
}

/// Indicator for a contact's entries. Silent entries never show.
pub fn indicator_for(entries: &[PingInboxEntry]) -> Indicator {
    let visible = || entries.iter().filter(|e| !e.is_silent());
    match aggregate(entries) {
        ContactDeliveryState::Downloading => visible()
            .filter(|e| matches!(e.state, PingState::DownloadQueued | PingState::Downloading))
            .min_by_key(|e| (e.created_at, e.id))
            .map(|e| Indicator::Typing { entry_id: e.id })
            .unwrap_or(Indicator::None),
        ContactDeliveryState::Paused => {
            let entry_ids: Vec<i64> = visible()
                .filter(|e| e.state == PingState::ManualRequired)
                .map(|e| e.id)
                .collect();
            if entry_ids.is_empty() {
                Indicator::None
            } else {
                Indicator::Locked { entry_ids }
            }
        }
        ContactDeliveryState::Idle | ContactDeliveryState::Backoff => Indicator::None,
    }
}

/// Drives the ping inbox and the outgoing ping/message pairs.
#[derive(Debug, Clone)]
pub struct DeliveryMachine {
    ctx: EngineContext,
}

impl DeliveryMachine {
    /// Machine over `ctx`.
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Current aggregate state for a contact.
    pub fn contact_state(&self, contact_id: i64) -> Result<ContactDeliveryState> {
        Ok(aggregate(&self.ctx.inbox().list_for_contact(contact_id)?))
    }

    /// Pending entries the user may see: everything not yet stored, minus
    /// silent sync pings.
    pub fn visible_pending(&self, contact_id: i64) -> Result<Vec<PingInboxEntry>> {
        Ok(self
            .ctx
            .inbox()
            .list_for_contact(contact_id)?
            .into_iter()
            .filter(|e| e.state.is_pending() && !e.is_silent())
            .collect())
    }

    /// What the conversation view should show for a contact.
    pub fn indicator(&self, contact_id: i64) -> Result<Indicator> {
        Ok(indicator_for(&self.ctx.inbox().list_for_contact(contact_id)?))
    }

    /// Atomically take ownership of an entry for download.
    ///
    /// Losing the race yields [`Error::ClaimConflict`]; the caller should
    /// treat that as someone else's success.
    pub fn claim(&self, entry_id: i64) -> Result<()> {
        if !self.ctx.inbox().claim(entry_id, now())? {
            debug!(entry_id, "claim lost");
            return Err(Error::ClaimConflict(entry_id));
        }
        let entry = self.entry(entry_id)?;
        self.publish(entry.contact_id)?;
        Ok(())
    }

    /// Move a failed download to FAILED_TEMP and schedule its retry. Once
    /// `retry.max_attempts` fetches have failed the entry goes to
    /// MANUAL_REQUIRED instead and waits for the user.
    ///
    /// Returns false if the entry was not in flight. The pong for the entry
    /// is withdrawn from the outbox; the inbox retry is what sends it again.
    pub fn fail_download(&self, entry_id: i64) -> Result<bool> {
        let entry = self.entry(entry_id)?;
        let at = now();
        let retry = &self.ctx.config().retry;
        let next = (entry.attempts + 1 < retry.max_attempts)
            .then(|| at + retry.backoff_secs(entry.attempts));
        if !self.ctx.inbox().mark_failed(entry_id, next, at)? {
            return Ok(false);
        }
        let outbox = self.ctx.outbox();
        if let Some(pong) = outbox.get_by_key(&pong_key(&entry.ping_id))? {
            if pong.status.is_undelivered() {
                outbox.mark_failed(pong.id, at)?;
            }
        }
        if next.is_none() {
            warn!(entry_id, attempts = entry.attempts + 1, "download retries exhausted");
        } else {
            debug!(entry_id, attempts = entry.attempts + 1, "download failed");
        }
        self.publish(entry.contact_id)?;
        Ok(true)
    }

    /// Repair entries whose plaintext already exists. Returns how many were
    /// removed.
    pub fn reconcile_ghosts(&self) -> Result<usize> {
        let ghosts = self.ctx.inbox().reconcile_ghosts(now())?;
        let mut contacts: Vec<i64> = ghosts.iter().map(|(_, contact)| *contact).collect();
        contacts.sort_unstable();
        contacts.dedup();
        for contact_id in contacts {
            self.publish(contact_id)?;
        }
        if !ghosts.is_empty() {
            debug!(count = ghosts.len(), "reconciled ghost entries");
        }
        Ok(ghosts.len())
    }

    /// Drop every entry for a contact, e.g. when the conversation is deleted.
    pub fn purge_contact(&self, contact_id: i64) -> Result<usize> {
        let removed = self.ctx.inbox().purge_contact(contact_id)?;
        self.ctx.forget_contact(contact_id)?;
        self.ctx.emit(EngineEvent::DeliveryStateChanged {
            contact_id,
            state: ContactDeliveryState::Idle,
        });
        Ok(removed)
    }

    /// Resolve the contact behind a frame's sender address. Blocked
    /// contacts resolve to `None` and their frames are dropped.
    fn sender(&self, address: &str) -> Result<Option<Contact>> {
        let contact = self
            .ctx
            .contacts()
            .get_by_address(address)?
            .ok_or_else(|| Error::Protocol("frame from unknown peer".into()))?;
        if contact.blocked {
            debug!(peer = %RedactedOnion(address), "dropping frame from blocked contact");
            return Ok(None);
        }
        if contact.status != FriendshipStatus::Confirmed {
            return Err(Error::Protocol("contact not confirmed".into()));
        }
        Ok(Some(contact))
    }

    /// Resolve and verify the sender of a signed body. The body must name
    /// us as recipient and carry a valid signature from the contact's
    /// long-term key.
    fn authenticate<B: SignedBody>(&self, body: &B) -> Result<Option<Contact>> {
        let Some(contact) = self.sender(body.sender())? else {
            return Ok(None);
        };
        if body.recipient() != self.ctx.identity().addresses.messaging.as_str() {
            return Err(Error::Protocol("frame addressed to another identity".into()));
        }
        if let Err(e) = body.verify(&contact.signing_public_key) {
            warn!(contact_id = contact.id, "delivery frame signature invalid");
            return Err(e);
        }
        Ok(Some(contact))
    }

    fn confirmed_contact(&self, contact_id: i64) -> Result<Contact> {
        let contact = self
            .ctx
            .contacts()
            .get(contact_id)?
            .ok_or_else(|| Error::NotFound(format!("contact {}", contact_id)))?;
        if contact.status != FriendshipStatus::Confirmed || contact.blocked {
            return Err(Error::Protocol(format!("contact {} cannot exchange messages", contact_id)));
        }
        Ok(contact)
    }

    fn entry(&self, entry_id: i64) -> Result<PingInboxEntry> {
        self.ctx
            .inbox()
            .get(entry_id)?
            .ok_or_else(|| Error::NotFound(format!("inbox entry {}", entry_id)))
    }

    /// Recompute a contact's aggregate and emit it if it changed.
    fn publish(&self, contact_id: i64) -> Result<()> {
        let state = self.contact_state(contact_id)?;
        if self.ctx.swap_delivery_state(contact_id, state)? {
            debug!(contact_id, ?state, "delivery state changed");
            self.ctx
                .emit(EngineEvent::DeliveryStateChanged { contact_id, state });
        }
        Ok(())
    }
}

fn ping_key(ping_id: &str) -> String {
    format!("ping:{}", ping_id)
}

fn msg_key(ping_id: &str) -> String {
    format!("msg:{}", ping_id)
}

fn pong_key(ping_id: &str) -> String {
    format!("pong:{}", ping_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContentType;

    fn entry(id: i64, state: PingState, content_type: ContentType) -> PingInboxEntry {
        PingInboxEntry {
            id,
            contact_id: 1,
            ping_id: format!("p{}", id),
            state,
            content_type,
            wire_bytes: vec![content_type as u8],
            attempts: 0,
            next_retry_at: None,
            created_at: 100 + id,
            updated_at: 100 + id,
        }
    }

    #[test]
    fn test_aggregate_priority() {
        use PingState::*;
        let text = ContentType::Text;
        assert_eq!(aggregate(&[]), ContactDeliveryState::Idle);
        assert_eq!(
            aggregate(&[entry(1, FailedTemp, text)]),
            ContactDeliveryState::Backoff
        );
        assert_eq!(
            aggregate(&[entry(1, FailedTemp, text), entry(2, ManualRequired, text)]),
            ContactDeliveryState::Paused
        );
        assert_eq!(
            aggregate(&[entry(1, ManualRequired, text), entry(2, Downloading, text)]),
            ContactDeliveryState::Downloading
        );
        assert_eq!(
            aggregate(&[entry(1, PingSeen, text)]),
            ContactDeliveryState::Idle
        );
    }

    #[test]
    fn test_indicator() {
        use PingState::*;
        let text = ContentType::Text;
        let silent = ContentType::ProfileSync;

        assert_eq!(
            indicator_for(&[entry(3, Downloading, text), entry(2, DownloadQueued, text)]),
            Indicator::Typing { entry_id: 2 }
        );
        // A silent download keeps the state but never shows typing.
        assert_eq!(
            indicator_for(&[entry(1, Downloading, silent)]),
            Indicator::None
        );
        assert_eq!(
            indicator_for(&[
                entry(1, ManualRequired, text),
                entry(2, ManualRequired, silent),
                entry(3, ManualRequired, text),
            ]),
            Indicator::Locked { entry_ids: vec![1, 3] }
        );
        assert_eq!(indicator_for(&[entry(1, FailedTemp, text)]), Indicator::None);
    }
}
