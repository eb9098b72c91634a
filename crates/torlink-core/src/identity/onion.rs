//! Tor v3 rendezvous addresses.
//!
//! ```text
//! checksum = SHA3-256(".onion checksum" || pubkey || 0x03)[..2]
//! address  = base32(pubkey || checksum || 0x03) + ".onion"
//! ```

use crate::error::{Error, Result};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

const ONION_VERSION: u8 = 0x03;
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const BASE32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// A validated v3 onion address, `<56 base32 chars>.onion`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OnionAddress(String);

fn checksum(pubkey: &[u8]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let hash = hasher.finalize();
    [hash[0], hash[1]]
}

impl OnionAddress {
    /// Parse and fully validate an address, including its checksum.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let host = s
            .strip_suffix(".onion")
            .ok_or_else(|| Error::Identity("must end with .onion".into()))?;
        if host.len() != 56 {
            return Err(Error::Identity("v3 address must be 56 characters".into()));
        }

        let decoded = base32::decode(BASE32, &host.to_uppercase())
            .ok_or_else(|| Error::Identity("invalid base32 encoding".into()))?;
        if decoded.len() != 35 || decoded[34] != ONION_VERSION {
            return Err(Error::Identity("unsupported onion version".into()));
        }
        if decoded[32..34] != checksum(&decoded[..32]) {
            return Err(Error::Identity("checksum mismatch".into()));
        }

        Ok(Self(s))
    }

    /// Derive the address of an onion service from its Ed25519 key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let pubkey = public_key.as_bytes();
        let mut bytes = [0u8; 35];
        bytes[..32].copy_from_slice(pubkey);
        bytes[32..34].copy_from_slice(&checksum(pubkey));
        bytes[34] = ONION_VERSION;

        let encoded = base32::encode(BASE32, &bytes);
        Self(format!("{}.onion", encoded.to_lowercase()))
    }

    /// The full address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OnionAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<OnionAddress> for String {
    fn from(addr: OnionAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", crate::logging::RedactedOnion(&self.0))
    }
}
