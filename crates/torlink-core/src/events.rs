//! Events emitted by the engine.
//!
//! Hosts subscribe through [`crate::context::EngineContext::subscribe`].
//! Sending never blocks: a slow subscriber lags and misses events rather
//! than stalling the protocol.

use crate::delivery::ContactDeliveryState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// How a handshake ended, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandshakeOutcome {
    /// The contact is confirmed on our side.
    Accepted,
    /// We rejected the incoming request.
    Rejected,
    /// A payload could not be decrypted with the PIN.
    InvalidPin,
    /// A SENDING request exceeded the staleness window.
    Stale,
    /// A payload carried a bad signature.
    SignatureInvalid,
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EngineEvent {
    /// A contact was added, changed or removed.
    ContactChanged {
        /// Contact id.
        contact_id: i64,
    },
    /// A contact's aggregate delivery state changed.
    DeliveryStateChanged {
        /// Contact id.
        contact_id: i64,
        /// New aggregate state.
        state: ContactDeliveryState,
    },
    /// A friend request arrived and waits for accept or reject.
    RequestReceived {
        /// Incoming request id.
        request_id: i64,
    },
    /// A message's plaintext was stored.
    MessageReceived {
        /// Contact id.
        contact_id: i64,
        /// Ping id of the message.
        ping_id: String,
        /// Background sync content that should not notify.
        silent: bool,
    },
    /// A message arrived that no key could open. The conversation continues.
    MessageUndecryptable {
        /// Contact id.
        contact_id: i64,
        /// Counter the envelope carried.
        counter: u64,
    },
    /// A handshake step finished.
    Handshake {
        /// Request the outcome belongs to, when one exists.
        request_id: Option<i64>,
        /// Outcome.
        outcome: HandshakeOutcome,
    },
}

/// New event channel.
pub fn channel() -> broadcast::Sender<EngineEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
