//! Friend-request handshake.
//!
//! ```text
//! Initiator                                       Acceptor
//!   │── Phase 1: card-lite, PIN-encrypted ─────────▶│  INCOMING PENDING
//!   │                                               │  (user accepts)
//!   │◀──── Phase 2: card + KEM ct, sealed to X25519 ─│  OUTGOING SENDING
//!   │  contact CONFIRMED, key chain seeded          │
//!   │── Confirm: card, sealed to X25519 ───────────▶│  contact CONFIRMED,
//!   │                                               │  key chain seeded
//! ```
//!
//! Nothing reaches the contact list before the peer has proven possession
//! of the keys it signed with. Every step persists its request row and its
//! outbox item in one transaction before touching the network, so the
//! retry worker can finish whatever a crash interrupted.

mod engine;
mod payload;

pub use engine::HandshakeEngine;
pub use payload::{
    ConfirmPayload, ContactCard, Phase1Payload, Phase2Payload, RequestMaterial, SignatureCheck,
    Signed, MATERIAL_VERSION,
};
