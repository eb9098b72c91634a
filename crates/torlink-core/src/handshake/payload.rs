//! Handshake payloads and the resume material stored with a request.
//!
//! Payloads travel as JSON with hex-encoded keys. A payload is signed over
//! its own JSON with the `signature` field left out, so signer and verifier
//! only have to agree on field order, which serde fixes by declaration.

use crate::crypto::{
    verify, SigningKeypair, HYBRID_CIPHERTEXT_SIZE, MLKEM_PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
    SIGNING_PUBLIC_KEY_SIZE, X25519_KEY_SIZE,
};
use crate::error::{Error, Result};
use crate::identity::{LocalIdentity, OnionAddress};
use crate::storage::{FriendshipStatus, NewContact};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Everything a peer needs to talk to us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    /// Name shown to the peer.
    pub display_name: String,
    /// Ed25519 public key, hex.
    pub ed25519_public_key: String,
    /// X25519 public key, hex.
    pub x25519_public_key: String,
    /// ML-KEM public key, hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyber_public_key: Option<String>,
    /// Messaging address.
    pub messaging_address: String,
    /// Voice address.
    pub voice_address: String,
    /// Friend-request address.
    pub friend_request_address: String,
    /// Reference to the sender's encrypted contact-list backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_reference: Option<String>,
}

impl ContactCard {
    /// Card describing the local identity.
    pub fn from_identity(identity: &LocalIdentity) -> Self {
        Self {
            display_name: identity.display_name.clone(),
            ed25519_public_key: hex::encode(identity.signing().public_key()),
            x25519_public_key: hex::encode(identity.x25519().public_key().as_bytes()),
            kyber_public_key: Some(hex::encode(identity.mlkem().public_bytes())),
            messaging_address: identity.addresses.messaging.to_string(),
            voice_address: identity.addresses.voice.to_string(),
            friend_request_address: identity.addresses.friend_request.to_string(),
            backup_reference: identity.backup_reference.clone(),
        }
    }

    /// Check field shapes and turn the card into a contact row.
    pub fn to_contact(&self, status: FriendshipStatus) -> Result<NewContact> {
        for address in [
            &self.messaging_address,
            &self.voice_address,
            &self.friend_request_address,
        ] {
            OnionAddress::parse(address)?;
        }
        Ok(NewContact {
            display_name: self.display_name.clone(),
            signing_public_key: decode_key(&self.ed25519_public_key, SIGNING_PUBLIC_KEY_SIZE)?,
            x25519_public_key: decode_key(&self.x25519_public_key, X25519_KEY_SIZE)?,
            kyber_public_key: self
                .kyber_public_key
                .as_deref()
                .map(|k| decode_key(k, MLKEM_PUBLIC_KEY_SIZE))
                .transpose()?,
            messaging_address: self.messaging_address.clone(),
            voice_address: self.voice_address.clone(),
            friend_request_address: self.friend_request_address.clone(),
            status,
        })
    }
}

/// Phase 1: "here is who I am", encrypted under the peer's PIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase1Payload {
    /// Initiator's display name.
    pub username: String,
    /// Where the acceptor should send Phase 2.
    pub friend_request_address: String,
    /// Initiator's X25519 public key, hex.
    pub x25519_public_key: String,
    /// Initiator's ML-KEM public key, hex. Absent for legacy peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyber_public_key: Option<String>,
    /// Always 1.
    pub phase: u8,
    /// Signer, hex. Legacy peers send unsigned payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ed25519_public_key: Option<String>,
    /// Signature, hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Phase 2: the acceptor's card and KEM ciphertext, sealed to the
/// initiator's X25519 key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase2Payload {
    /// Acceptor's card.
    pub contact_card: ContactCard,
    /// Hybrid KEM ciphertext, hex. Absent when the initiator had no ML-KEM key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyber_ciphertext: Option<String>,
    /// Always 2.
    pub phase: u8,
    /// Signer, hex.
    pub ed25519_public_key: String,
    /// Signature, hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Phase 3: the initiator's card, sealed to the acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPayload {
    /// Initiator's card.
    pub contact_card: ContactCard,
    /// Always 3.
    pub phase: u8,
    /// Signer, hex.
    pub ed25519_public_key: String,
    /// Signature, hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Outcome of checking a payload's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// Signed and valid.
    Verified,
    /// No signature present.
    Unsigned,
}

/// Shared signing behaviour of the three payloads.
pub trait Signed: Serialize + Clone {
    /// Expected `phase` value.
    const PHASE: u8;

    /// The `phase` field.
    fn phase(&self) -> u8;
    /// Hex signer key, if present.
    fn signer(&self) -> Option<&str>;
    /// Hex signature, if present.
    fn signature(&self) -> Option<&str>;
    /// Set or clear the signature.
    fn set_signature(&mut self, signature: Option<String>);

    /// Bytes covered by the signature.
    fn signable_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.set_signature(None);
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign in place. The signer field must already name `keys`.
    fn sign(&mut self, keys: &SigningKeypair) -> Result<()> {
        let signature = keys.sign(&self.signable_bytes()?);
        self.set_signature(Some(hex::encode(signature)));
        Ok(())
    }

    /// Check the signature. A signature without a signer, a malformed one,
    /// or one that does not verify is [`Error::SignatureInvalid`].
    fn check_signature(&self) -> Result<SignatureCheck> {
        if self.phase() != Self::PHASE {
            return Err(Error::Protocol(format!(
                "expected phase {}, got {}",
                Self::PHASE,
                self.phase()
            )));
        }
        let (signer, signature) = match (self.signer(), self.signature()) {
            (_, None) => return Ok(SignatureCheck::Unsigned),
            (None, Some(_)) => return Err(Error::SignatureInvalid),
            (Some(signer), Some(signature)) => (signer, signature),
        };
        let signer = hex::decode(signer).map_err(|_| Error::SignatureInvalid)?;
        let signature = hex::decode(signature).map_err(|_| Error::SignatureInvalid)?;
        if signature.len() != SIGNATURE_SIZE
            || !verify(&self.signable_bytes()?, &signature, &signer)
        {
            return Err(Error::SignatureInvalid);
        }
        Ok(SignatureCheck::Verified)
    }

    /// Like [`Signed::check_signature`], but an unsigned payload fails too.
    fn require_signature(&self) -> Result<()> {
        match self.check_signature()? {
            SignatureCheck::Verified => Ok(()),
            SignatureCheck::Unsigned => Err(Error::SignatureInvalid),
        }
    }
}

impl Signed for Phase1Payload {
    const PHASE: u8 = 1;

    fn phase(&self) -> u8 {
        self.phase
    }
    fn signer(&self) -> Option<&str> {
        self.ed25519_public_key.as_deref()
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_signature(&mut self, signature: Option<String>) {
        self.signature = signature;
    }
}

impl Signed for Phase2Payload {
    const PHASE: u8 = 2;

    fn phase(&self) -> u8 {
        self.phase
    }
    fn signer(&self) -> Option<&str> {
        Some(&self.ed25519_public_key)
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_signature(&mut self, signature: Option<String>) {
        self.signature = signature;
    }
}

impl Signed for ConfirmPayload {
    const PHASE: u8 = 3;

    fn phase(&self) -> u8 {
        self.phase
    }
    fn signer(&self) -> Option<&str> {
        Some(&self.ed25519_public_key)
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_signature(&mut self, signature: Option<String>) {
        self.signature = signature;
    }
}

impl Phase1Payload {
    /// Signed Phase-1 payload for the local identity.
    pub fn new(identity: &LocalIdentity) -> Result<Self> {
        let mut payload = Self {
            username: identity.display_name.clone(),
            friend_request_address: identity.addresses.friend_request.to_string(),
            x25519_public_key: hex::encode(identity.x25519().public_key().as_bytes()),
            kyber_public_key: Some(hex::encode(identity.mlkem().public_bytes())),
            phase: Self::PHASE,
            ed25519_public_key: Some(hex::encode(identity.signing().public_key())),
            signature: None,
        };
        payload.sign(identity.signing())?;
        Ok(payload)
    }

    /// Parse and shape-check decrypted JSON.
    pub fn parse(json: &[u8]) -> Result<Self> {
        let payload: Self = serde_json::from_slice(json)?;
        OnionAddress::parse(&payload.friend_request_address)?;
        payload.x25519()?;
        payload.kyber()?;
        Ok(payload)
    }

    /// Initiator's X25519 key.
    pub fn x25519(&self) -> Result<Vec<u8>> {
        decode_key(&self.x25519_public_key, X25519_KEY_SIZE)
    }

    /// Initiator's ML-KEM key, if published.
    pub fn kyber(&self) -> Result<Option<Vec<u8>>> {
        self.kyber_public_key
            .as_deref()
            .map(|k| decode_key(k, MLKEM_PUBLIC_KEY_SIZE))
            .transpose()
    }
}

impl Phase2Payload {
    /// Parse, shape-check and verify decrypted JSON. The signer must be the
    /// key on the card.
    pub fn parse(json: &[u8]) -> Result<Self> {
        let payload: Self = serde_json::from_slice(json)?;
        payload.require_signature()?;
        if payload.ed25519_public_key != payload.contact_card.ed25519_public_key {
            return Err(Error::SignatureInvalid);
        }
        payload.kyber_ciphertext()?;
        Ok(payload)
    }

    /// Hybrid KEM ciphertext, if present.
    pub fn kyber_ciphertext(&self) -> Result<Option<Vec<u8>>> {
        self.kyber_ciphertext
            .as_deref()
            .map(|c| decode_key(c, HYBRID_CIPHERTEXT_SIZE))
            .transpose()
    }
}

impl ConfirmPayload {
    /// Signed confirmation carrying the local card.
    pub fn new(identity: &LocalIdentity) -> Result<Self> {
        let mut payload = Self {
            contact_card: ContactCard::from_identity(identity),
            phase: Self::PHASE,
            ed25519_public_key: hex::encode(identity.signing().public_key()),
            signature: None,
        };
        payload.sign(identity.signing())?;
        Ok(payload)
    }

    /// Parse, shape-check and verify decrypted JSON.
    pub fn parse(json: &[u8]) -> Result<Self> {
        let payload: Self = serde_json::from_slice(json)?;
        payload.require_signature()?;
        if payload.ed25519_public_key != payload.contact_card.ed25519_public_key {
            return Err(Error::SignatureInvalid);
        }
        Ok(payload)
    }
}

fn decode_key(hex_key: &str, len: usize) -> Result<Vec<u8>> {
    let bytes = hex::decode(hex_key).map_err(|e| Error::InvalidKey(e.to_string()))?;
    if bytes.len() != len {
        return Err(Error::InvalidKey(format!(
            "expected {} bytes, got {}",
            len,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Version byte in front of stored [`RequestMaterial`].
pub const MATERIAL_VERSION: u8 = 0x02;

/// What a pending request needs to resume after a restart.
///
/// Nested payloads are kept as their JSON bytes so the optional fields
/// survive the binary encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestMaterial {
    /// We sent Phase 1; `frame` is the PIN-encrypted wire frame.
    Phase1Sent {
        /// Encoded frame, ready to resend.
        frame: Vec<u8>,
    },
    /// A peer's decrypted Phase 1, waiting for accept or reject.
    Phase1Received {
        /// Phase-1 JSON.
        payload: Vec<u8>,
    },
    /// We accepted and sent Phase 2; the secret waits for confirmation.
    Phase2Sent {
        /// Encoded frame, ready to resend.
        frame: Vec<u8>,
        /// Hybrid secret retained for the key chain.
        shared_secret: Vec<u8>,
        /// The initiator's Phase-1 JSON.
        peer: Vec<u8>,
    },
}

impl RequestMaterial {
    /// `version || bincode(self)`.
    pub fn encode(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(vec![MATERIAL_VERSION]);
        out.extend_from_slice(&bincode::serialize(self)?);
        Ok(out)
    }

    /// Inverse of [`RequestMaterial::encode`]. Anything written by another
    /// format version is [`Error::UnsupportedFormat`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&MATERIAL_VERSION, rest)) => {
                bincode::deserialize(rest).map_err(|_| Error::UnsupportedFormat)
            }
            _ => Err(Error::UnsupportedFormat),
        }
    }

    /// The wire frame to resend, for outgoing material.
    pub fn frame(&self) -> Option<&[u8]> {
        match self {
            Self::Phase1Sent { frame } | Self::Phase2Sent { frame, .. } => Some(frame),
            Self::Phase1Received { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::identity;

    #[test]
    fn test_phase1_signature() {
        let alice = identity("alice");
        let payload = Phase1Payload::new(&alice).expect("payload");
        assert_eq!(payload.check_signature().expect("check"), SignatureCheck::Verified);

        let json = serde_json::to_vec(&payload).expect("json");
        let parsed = Phase1Payload::parse(&json).expect("parse");
        assert_eq!(parsed, payload);

        let mut tampered = payload.clone();
        tampered.username = "mallory".into();
        assert!(matches!(tampered.check_signature(), Err(Error::SignatureInvalid)));
    }

    #[test]
    fn test_unsigned_legacy_phase1() {
        let alice = identity("alice");
        let mut payload = Phase1Payload::new(&alice).expect("payload");
        payload.ed25519_public_key = None;
        payload.signature = None;
        payload.kyber_public_key = None;

        let json = serde_json::to_string(&payload).expect("json");
        assert!(!json.contains("signature"));
        assert!(!json.contains("kyber"));
        let parsed = Phase1Payload::parse(json.as_bytes()).expect("parse");
        assert_eq!(parsed.check_signature().expect("check"), SignatureCheck::Unsigned);
    }

    #[test]
    fn test_phase2_signer_must_match_card() {
        let bob = identity("bob");
        let mallory = identity("mallory");
        let mut payload = Phase2Payload {
            contact_card: ContactCard::from_identity(&bob),
            kyber_ciphertext: None,
            phase: 2,
            ed25519_public_key: hex::encode(mallory.signing().public_key()),
            signature: None,
        };
        payload.sign(mallory.signing()).expect("sign");
        let json = serde_json::to_vec(&payload).expect("json");
        assert!(matches!(Phase2Payload::parse(&json), Err(Error::SignatureInvalid)));
    }

    #[test]
    fn test_card_to_contact() {
        let bob = identity("bob");
        let contact = ContactCard::from_identity(&bob)
            .to_contact(FriendshipStatus::Confirmed)
            .expect("contact");
        assert_eq!(contact.signing_public_key, bob.signing().public_key().to_vec());
        assert_eq!(contact.messaging_address, bob.addresses.messaging.to_string());

        let mut bad = ContactCard::from_identity(&bob);
        bad.x25519_public_key = "abcd".into();
        assert!(matches!(
            bad.to_contact(FriendshipStatus::Confirmed),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn test_material_version() {
        let material = RequestMaterial::Phase1Sent { frame: vec![0x07, 1, 2] };
        let bytes = material.encode().expect("encode");
        assert_eq!(bytes[0], MATERIAL_VERSION);
        assert_eq!(RequestMaterial::decode(&bytes).expect("decode"), material);

        let mut old = bytes.to_vec();
        old[0] = 0x01;
        assert!(matches!(RequestMaterial::decode(&old), Err(Error::UnsupportedFormat)));
        assert!(matches!(RequestMaterial::decode(&[]), Err(Error::UnsupportedFormat)));
    }
}
