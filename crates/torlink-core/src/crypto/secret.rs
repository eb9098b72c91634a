//! Encryption under a short pre-shared secret (the handshake PIN).
//!
//! Blob layout: `version (1) || salt (16) || nonce (12) || ciphertext || tag`.
//! The key is PBKDF2-HMAC-SHA256 over the PIN with the per-blob salt.

use super::aead::{self, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use super::random_bytes;
use crate::error::{Error, Result};
use hmac::Hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Current blob version byte.
pub const SECRET_BLOB_VERSION: u8 = 0x01;

/// Salt length in bytes.
pub const SALT_SIZE: usize = 16;

/// PBKDF2 rounds for PIN-derived keys.
pub const PIN_KDF_ITERATIONS: u32 = 100_000;

const HEADER_SIZE: usize = 1 + SALT_SIZE;

fn derive_key(secret: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(secret, salt, PIN_KDF_ITERATIONS, &mut key[..])
        .map_err(|_| Error::Crypto("key derivation failed".into()))?;
    Ok(key)
}

/// Encrypt `plaintext` under `secret`.
pub fn encrypt_with_secret(plaintext: &[u8], secret: &str) -> Result<Vec<u8>> {
    let salt: [u8; SALT_SIZE] = random_bytes();
    let key = derive_key(secret.as_bytes(), &salt)?;

    let mut header = [0u8; HEADER_SIZE];
    header[0] = SECRET_BLOB_VERSION;
    header[1..].copy_from_slice(&salt);

    let sealed = aead::seal_with_random_nonce(&key, plaintext, &header)?;

    let mut output = Vec::with_capacity(HEADER_SIZE + sealed.len());
    output.extend_from_slice(&header);
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Decrypt a blob produced by [`encrypt_with_secret`].
///
/// Any authentication failure is reported as [`Error::InvalidPin`]: with a
/// well-formed blob, the only way to fail the tag is the wrong secret.
pub fn decrypt_with_secret(blob: &[u8], secret: &str) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < HEADER_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(Error::Protocol("secret blob too short".into()));
    }
    if blob[0] != SECRET_BLOB_VERSION {
        return Err(Error::UnsupportedFormat);
    }
    let (header, sealed) = blob.split_at(HEADER_SIZE);
    let key = derive_key(secret.as_bytes(), &header[1..])?;

    aead::open_with_prepended_nonce(&key, sealed, header).map_err(|_| Error::InvalidPin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_roundtrip() {
        let payload = br#"{"username":"alice","phase":1}"#;
        let blob = encrypt_with_secret(payload, "1234567890").expect("encrypt");
        let plain = decrypt_with_secret(&blob, "1234567890").expect("decrypt");
        assert_eq!(&plain[..], payload);
    }

    #[test]
    fn test_wrong_pin_is_invalid_pin() {
        let blob = encrypt_with_secret(b"hello", "1234567890").expect("encrypt");
        let err = decrypt_with_secret(&blob, "0000000000").expect_err("wrong pin");
        assert!(matches!(err, Error::InvalidPin));
    }

    #[test]
    fn test_same_plaintext_differs() {
        let a = encrypt_with_secret(b"hello", "123456").expect("a");
        let b = encrypt_with_secret(b"hello", "123456").expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_version() {
        let mut blob = encrypt_with_secret(b"hello", "123456").expect("encrypt");
        blob[0] = 0x7f;
        assert!(matches!(
            decrypt_with_secret(&blob, "123456"),
            Err(Error::UnsupportedFormat)
        ));
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            decrypt_with_secret(&[SECRET_BLOB_VERSION; 8], "123456"),
            Err(Error::Protocol(_))
        ));
    }
}
