//! Wire crypto facade.
//!
//! Pure functions composed by the handshake and key chain. Nothing here
//! touches storage or the network.
//!
//! - **X25519**: key agreement, sealed boxes
//! - **ML-KEM-1024**: post-quantum half of the hybrid KEM
//! - **Ed25519**: handshake signatures
//! - **ChaCha20-Poly1305**: all symmetric encryption
//! - **PBKDF2 / HKDF / HMAC-SHA256**: key derivation

mod aead;
pub mod chain;
mod kem;
mod keys;
mod sealed;
mod secret;
mod sign;

pub use aead::{
    decrypt, encrypt, open_with_prepended_nonce, random_nonce, seal_with_random_nonce, KEY_SIZE,
    NONCE_SIZE, TAG_SIZE,
};
pub use kem::{
    classical_agreement, hybrid_decapsulate, hybrid_encapsulate, MlKemKeypair,
    HYBRID_CIPHERTEXT_SIZE, HYBRID_SECRET_SIZE, MLKEM_PUBLIC_KEY_SIZE,
};
pub use keys::{
    generate_ephemeral_keypair, EphemeralKeypair, SharedSecret, StaticKeypair, X25519PublicKey,
    X25519_KEY_SIZE,
};
pub use sealed::{open_sealed, seal_to};
pub use secret::{decrypt_with_secret, encrypt_with_secret};
pub use sign::{verify, SigningKeypair, SIGNATURE_SIZE, SIGNING_PUBLIC_KEY_SIZE};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// HKDF-SHA256 extract-and-expand.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Random 128-bit identifier rendered as hex, used for ping ids.
pub fn random_id() -> String {
    hex::encode(random_bytes::<16>())
}
