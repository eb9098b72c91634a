//! ChaCha20-Poly1305 helpers.
//!
//! Every blob the engine puts on the wire or in storage that needs
//! confidentiality goes through here. Nonces are random and travel with
//! the ciphertext.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of an encryption key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Encrypt `plaintext`, binding `aad`. Returns `ciphertext || tag`.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

/// Decrypt `ciphertext || tag`.
///
/// Returns a generic error on failure; callers map it to the
/// domain error that fits (wrong PIN, undecryptable message).
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| Error::Crypto("decryption failed".into()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt with a random nonce. Output: `nonce || ciphertext || tag`.
pub fn seal_with_random_nonce(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce = random_nonce();
    let ciphertext = encrypt(key, &nonce, plaintext, aad)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Inverse of [`seal_with_random_nonce`].
pub fn open_with_prepended_nonce(
    key: &[u8; KEY_SIZE],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("ciphertext too short".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    let nonce: [u8; NONCE_SIZE] = nonce
        .try_into()
        .map_err(|_| Error::Crypto("invalid nonce".into()))?;
    decrypt(key, &nonce, ciphertext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [42u8; KEY_SIZE];
        let nonce = random_nonce();

        let ciphertext = encrypt(&key, &nonce, b"hello", b"hdr").expect("encrypt");
        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);

        let plaintext = decrypt(&key, &nonce, &ciphertext, b"hdr").expect("decrypt");
        assert_eq!(&*plaintext, b"hello");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [42u8; KEY_SIZE];
        let nonce = random_nonce();

        let ciphertext = encrypt(&key, &nonce, b"secret", b"correct").expect("encrypt");
        assert!(decrypt(&key, &nonce, &ciphertext, b"wrong").is_err());
    }

    #[test]
    fn test_prepended_nonce() {
        let key = [7u8; KEY_SIZE];
        let sealed = seal_with_random_nonce(&key, b"payload", b"").expect("seal");
        assert_eq!(sealed.len(), NONCE_SIZE + 7 + TAG_SIZE);

        let opened = open_with_prepended_nonce(&key, &sealed, b"").expect("open");
        assert_eq!(&*opened, b"payload");

        let mut tampered = sealed.clone();
        tampered[NONCE_SIZE] ^= 0x01;
        assert!(open_with_prepended_nonce(&key, &tampered, b"").is_err());

        assert!(open_with_prepended_nonce(&key, &sealed[..10], b"").is_err());
    }
}
