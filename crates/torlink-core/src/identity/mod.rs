//! Local identity.
//!
//! One identity per database: display name, three long-term keypairs
//! (Ed25519 signing, X25519 and ML-KEM key exchange), the three rendezvous
//! addresses the host's onion services listen on, and the current
//! friend-request PIN handed out of band to new contacts.
//!
//! ## Security
//!
//! - Secret keys are zeroized on drop
//! - Fingerprints enable out-of-band verification

mod onion;

pub use onion::OnionAddress;

use crate::config::PinMode;
use crate::crypto::{MlKemKeypair, SigningKeypair, StaticKeypair};
use crate::error::Result;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// The rendezvous addresses published by the local onion services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAddresses {
    /// Where pings, pongs and messages arrive.
    pub messaging: OnionAddress,
    /// Where call signalling arrives.
    pub voice: OnionAddress,
    /// Where handshake payloads arrive.
    pub friend_request: OnionAddress,
}

/// The local user's long-term identity.
pub struct LocalIdentity {
    /// Name shown to contacts.
    pub display_name: String,
    /// Published rendezvous addresses.
    pub addresses: IdentityAddresses,
    /// Opaque reference to the encrypted contact-list backup, if any.
    pub backup_reference: Option<String>,
    signing: SigningKeypair,
    x25519: StaticKeypair,
    mlkem: MlKemKeypair,
    pin: Zeroizing<String>,
}

impl LocalIdentity {
    /// Generate a fresh identity with a PIN sized for `pin_mode`.
    pub fn generate(
        display_name: impl Into<String>,
        addresses: IdentityAddresses,
        pin_mode: PinMode,
    ) -> Result<Self> {
        Ok(Self {
            display_name: display_name.into(),
            addresses,
            backup_reference: None,
            signing: SigningKeypair::generate(),
            x25519: StaticKeypair::generate(),
            mlkem: MlKemKeypair::generate()?,
            pin: generate_pin(pin_mode),
        })
    }

    /// Reassemble from stored parts.
    pub fn from_parts(
        display_name: String,
        addresses: IdentityAddresses,
        backup_reference: Option<String>,
        signing: SigningKeypair,
        x25519: StaticKeypair,
        mlkem: MlKemKeypair,
        pin: String,
    ) -> Self {
        Self {
            display_name,
            addresses,
            backup_reference,
            signing,
            x25519,
            mlkem,
            pin: Zeroizing::new(pin),
        }
    }

    /// Ed25519 signing keypair.
    pub fn signing(&self) -> &SigningKeypair {
        &self.signing
    }

    /// X25519 key-exchange keypair.
    pub fn x25519(&self) -> &StaticKeypair {
        &self.x25519
    }

    /// ML-KEM key-exchange keypair.
    pub fn mlkem(&self) -> &MlKemKeypair {
        &self.mlkem
    }

    /// The PIN peers must use to reach us.
    pub fn pin(&self) -> &str {
        &self.pin
    }

    /// Replace the PIN, e.g. after the user switches PIN mode.
    pub fn rotate_pin(&mut self, pin_mode: PinMode) {
        self.pin = generate_pin(pin_mode);
    }

    /// SHA-256 fingerprint of the signing key, hex encoded.
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.signing.public_key())
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("display_name", &self.display_name)
            .field("addresses", &self.addresses)
            .field("signing", &self.signing)
            .finish_non_exhaustive()
    }
}

/// Random all-digit PIN of the length `pin_mode` requires.
pub fn generate_pin(pin_mode: PinMode) -> Zeroizing<String> {
    let mut rng = rand::rngs::OsRng;
    let pin: String = (0..pin_mode.digits())
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    Zeroizing::new(pin)
}

/// SHA-256 fingerprint of a signing public key.
pub fn compute_fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A random, checksum-valid onion address.
    pub fn random_onion() -> OnionAddress {
        OnionAddress::from_public_key(&SigningKeypair::generate().verifying_key())
    }

    /// Identity with random addresses.
    pub fn identity(name: &str) -> LocalIdentity {
        let addresses = IdentityAddresses {
            messaging: random_onion(),
            voice: random_onion(),
            friend_request: random_onion(),
        };
        LocalIdentity::generate(name, addresses, PinMode::Standard).expect("identity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pin() {
        for mode in [PinMode::Standard, PinMode::Legacy] {
            let pin = generate_pin(mode);
            mode.validate_pin(&pin).expect("valid pin");
        }
    }

    #[test]
    fn test_identity_fingerprint() {
        let id = test_support::identity("alice");
        assert_eq!(id.fingerprint().len(), 64);
        assert_eq!(id.pin().len(), 10);
    }
}
