//! Ed25519 signatures over handshake payloads.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an Ed25519 public key.
pub const SIGNING_PUBLIC_KEY_SIZE: usize = 32;

/// Long-term signing identity.
pub struct SigningKeypair {
    signing_key: SigningKey,
}

impl SigningKeypair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from the 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("signing seed must be 32 bytes".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Secret seed for persistence.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Public verifying key bytes.
    pub fn public_key(&self) -> [u8; SIGNING_PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKeypair({}...)", hex::encode(&self.public_key()[..8]))
    }
}

/// Check `signature` over `message` against `public_key`.
///
/// Malformed keys or signatures simply fail verification.
pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; SIGNING_PUBLIC_KEY_SIZE]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"phase one");
        assert!(verify(b"phase one", &sig, &kp.public_key()));
        assert!(!verify(b"phase two", &sig, &kp.public_key()));
    }

    #[test]
    fn test_malformed_inputs() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"x");
        assert!(!verify(b"x", &sig[..63], &kp.public_key()));
        assert!(!verify(b"x", &sig, &[0u8; 5]));
    }

    #[test]
    fn test_restore() {
        let kp = SigningKeypair::generate();
        let restored = SigningKeypair::from_secret_bytes(&*kp.secret_bytes()).expect("restore");
        assert_eq!(kp.public_key(), restored.public_key());
    }
}
