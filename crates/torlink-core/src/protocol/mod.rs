//! Wire framing.
//!
//! Every transmission is one frame sent to a peer's rendezvous address on
//! the port for its type:
//!
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │  Type   │            Body              │
//! │ (1 byte)│  (opaque or bincode struct)  │
//! └─────────┴──────────────────────────────┘
//! ```
//!
//! Handshake bodies are opaque ciphertext. Ping, pong, message and ack
//! bodies are small bincode structs; message bodies carry an
//! [`Envelope`] produced by the key chain. Pings, pongs and delivery acks
//! are signed with the sender's long-term key and name their recipient
//! (see [`SignedBody`]).

mod envelope;

pub use envelope::{Envelope, ENVELOPE_HEADER_SIZE, ENVELOPE_VERSION};

use crate::config::TransportConfig;
use crate::crypto::{verify, SigningKeypair};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Largest frame accepted from the wire (64 KiB).
pub const MAX_FRAME_SIZE: usize = 65536;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WireType {
    /// New ciphertext is available.
    Ping = 0x01,
    /// Ready to receive the ciphertext for a ping.
    Pong = 0x02,
    /// Ciphertext for a previously pinged id.
    Message = 0x03,
    /// Idempotent acknowledgement.
    Ack = 0x06,
    /// Phase-1 handshake blob.
    FriendRequest = 0x07,
    /// Phase-2 handshake blob.
    FriendRequestAccepted = 0x08,
}

impl WireType {
    /// Parse from the leading frame byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x03 => Ok(Self::Message),
            0x06 => Ok(Self::Ack),
            0x07 => Ok(Self::FriendRequest),
            0x08 => Ok(Self::FriendRequestAccepted),
            _ => Err(Error::Protocol(format!("unknown wire type: {:#04x}", byte))),
        }
    }

    /// The byte value.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Virtual port this frame type is delivered to.
    pub fn port(self, transport: &TransportConfig) -> u16 {
        match self {
            Self::Ping | Self::Pong | Self::Message => transport.message_port,
            Self::FriendRequest | Self::FriendRequestAccepted => transport.friend_request_port,
            Self::Ack => transport.ack_port,
        }
    }
}

/// Content-type tag carried as the first byte of a ping body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContentType {
    /// User-authored text.
    Text = 0x03,
    /// Background profile sync. Never shown to the user.
    ProfileSync = 0x0F,
}

impl ContentType {
    /// Parse from a tag byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x03 => Ok(Self::Text),
            0x0F => Ok(Self::ProfileSync),
            _ => Err(Error::Protocol(format!("unknown content type: {:#04x}", byte))),
        }
    }

    /// Silent content never surfaces in UI lists or indicators.
    pub fn is_silent(self) -> bool {
        matches!(self, Self::ProfileSync)
    }
}

/// A typed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub wire_type: WireType,
    /// Frame body.
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a frame from a type and raw body.
    pub fn new(wire_type: WireType, body: Vec<u8>) -> Self {
        Self { wire_type, body }
    }

    /// Build a frame with a bincode body.
    pub fn with_body<T: Serialize>(wire_type: WireType, body: &T) -> Result<Self> {
        Ok(Self::new(wire_type, bincode::serialize(body)?))
    }

    /// Serialize to `type || body`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.body.len());
        out.push(self.wire_type.to_byte());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse `type || body`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(Error::Protocol("frame too large".into()));
        }
        let (&type_byte, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Protocol("empty frame".into()))?;
        Ok(Self::new(WireType::from_byte(type_byte)?, body.to_vec()))
    }

    /// Decode a bincode body.
    pub fn decode_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.body)?)
    }
}

/// A delivery body signed by its sender.
///
/// The signature covers a per-type domain tag and the bincode encoding of
/// the body with an empty signature field, so a body cannot be replayed
/// as another type or to another recipient.
pub trait SignedBody: Serialize + Clone {
    /// Domain separation tag.
    const DOMAIN: &'static [u8];

    /// Sender's messaging address.
    fn sender(&self) -> &str;
    /// Recipient's messaging address.
    fn recipient(&self) -> &str;
    /// Raw Ed25519 signature.
    fn signature(&self) -> &[u8];
    /// Replace the signature.
    fn set_signature(&mut self, signature: Vec<u8>);

    /// Bytes covered by the signature.
    fn signable_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.set_signature(Vec::new());
        let mut out = Self::DOMAIN.to_vec();
        out.extend_from_slice(&bincode::serialize(&unsigned)?);
        Ok(out)
    }

    /// Sign with `keys`, consuming the unsigned body.
    fn signed(mut self, keys: &SigningKeypair) -> Result<Self> {
        let signature = keys.sign(&self.signable_bytes()?);
        self.set_signature(signature.to_vec());
        Ok(self)
    }

    /// Check the signature against the sender's public key.
    fn verify(&self, public_key: &[u8]) -> Result<()> {
        if verify(&self.signable_bytes()?, self.signature(), public_key) {
            Ok(())
        } else {
            Err(Error::SignatureInvalid)
        }
    }
}

macro_rules! signed_body {
    ($body:ty, $domain:literal) => {
        impl SignedBody for $body {
            const DOMAIN: &'static [u8] = $domain;

            fn sender(&self) -> &str {
                &self.sender
            }

            fn recipient(&self) -> &str {
                &self.recipient
            }

            fn signature(&self) -> &[u8] {
                &self.signature
            }

            fn set_signature(&mut self, signature: Vec<u8>) {
                self.signature = signature;
            }
        }
    };
}

signed_body!(PingBody, b"torlink/ping/v1");
signed_body!(PongBody, b"torlink/pong/v1");
signed_body!(AckBody, b"torlink/ack/v1");

/// Ping body, preceded on the wire by its [`ContentType`] byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingBody {
    /// Sender-chosen id naming the pending ciphertext.
    pub ping_id: String,
    /// Sender's messaging address.
    pub sender: String,
    /// Recipient's messaging address.
    pub recipient: String,
    /// Sender's Ed25519 signature.
    pub signature: Vec<u8>,
}

impl PingBody {
    /// Encode as `content_type || bincode(self)`.
    pub fn encode(&self, content_type: ContentType) -> Result<Vec<u8>> {
        let mut out = vec![content_type as u8];
        out.extend_from_slice(&bincode::serialize(self)?);
        Ok(out)
    }

    /// Split a ping body into its tag and struct.
    pub fn decode(bytes: &[u8]) -> Result<(ContentType, Self)> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Protocol("empty ping".into()))?;
        Ok((ContentType::from_byte(tag)?, bincode::deserialize(rest)?))
    }
}

/// Pong body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongBody {
    /// Ping being answered.
    pub ping_id: String,
    /// Responder's messaging address.
    pub sender: String,
    /// Original sender's messaging address.
    pub recipient: String,
    /// Responder's Ed25519 signature.
    pub signature: Vec<u8>,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Ping this ciphertext belongs to.
    pub ping_id: String,
    /// Sender's messaging address.
    pub sender: String,
    /// Content tag, repeated so the receiver can file it without the ping.
    pub content_type: u8,
    /// Encoded [`Envelope`].
    pub envelope: Vec<u8>,
}

/// What an ack acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckType {
    /// Ping recorded; stop resending it.
    PingAck,
    /// Message stored; stop resending it.
    MessageAck,
    /// Handshake confirmation; `blob` carries the sealed confirm payload.
    HandshakeConfirm,
}

/// Ack body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    /// Kind of acknowledgement.
    pub ack_type: AckType,
    /// Ping id (or empty for handshake confirmation).
    pub id: String,
    /// Sender's messaging address.
    pub sender: String,
    /// Recipient's messaging address.
    pub recipient: String,
    /// Sender's Ed25519 signature. Empty for handshake confirmations,
    /// whose sealed payload is signed instead.
    pub signature: Vec<u8>,
    /// Optional sealed payload.
    pub blob: Option<Vec<u8>>,
}
