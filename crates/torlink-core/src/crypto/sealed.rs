//! Encryption to a peer's static X25519 key.
//!
//! Used once the peer's key is known (Phase 2 and confirmation), so the
//! PIN is no longer involved. Blob layout:
//! `ephemeral_public (32) || nonce (12) || ciphertext || tag`.

use super::aead::{self, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use super::hkdf_derive;
use super::keys::{generate_ephemeral_keypair, SharedSecret, StaticKeypair, X25519PublicKey};
use crate::error::{Error, Result};
use zeroize::Zeroizing;

const SEALED_INFO: &[u8] = b"torlink-sealed-v1";

fn box_key(dh: &SharedSecret, eph: &X25519PublicKey, recipient: &X25519PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let okm = hkdf_derive(Some(&salt), dh.as_bytes(), SEALED_INFO, KEY_SIZE)?;
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&okm);
    Ok(key)
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
pub fn seal_to(recipient: &X25519PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let eph = generate_ephemeral_keypair();
    let eph_public = *eph.public_key();
    let dh = eph.diffie_hellman(recipient);
    let key = box_key(&dh, &eph_public, recipient)?;

    let sealed = aead::seal_with_random_nonce(&key, plaintext, eph_public.as_bytes())?;

    let mut output = Vec::with_capacity(32 + sealed.len());
    output.extend_from_slice(eph_public.as_bytes());
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Open a blob produced by [`seal_to`] with our static keypair.
pub fn open_sealed(own: &StaticKeypair, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if blob.len() < 32 + NONCE_SIZE + TAG_SIZE {
        return Err(Error::Protocol("sealed blob too short".into()));
    }
    let (eph_bytes, sealed) = blob.split_at(32);
    let eph_public = X25519PublicKey::from_slice(eph_bytes)?;
    let dh = own.diffie_hellman(&eph_public);
    let key = box_key(&dh, &eph_public, own.public_key())?;

    aead::open_with_prepended_nonce(&key, sealed, eph_public.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let bob = StaticKeypair::generate();
        let blob = seal_to(bob.public_key(), b"contact card").expect("seal");
        let plain = open_sealed(&bob, &blob).expect("open");
        assert_eq!(&plain[..], b"contact card");
    }

    #[test]
    fn test_wrong_recipient() {
        let bob = StaticKeypair::generate();
        let eve = StaticKeypair::generate();
        let blob = seal_to(bob.public_key(), b"contact card").expect("seal");
        assert!(open_sealed(&eve, &blob).is_err());
    }

    #[test]
    fn test_tampered_ephemeral() {
        let bob = StaticKeypair::generate();
        let mut blob = seal_to(bob.public_key(), b"x").expect("seal");
        blob[0] ^= 0x01;
        assert!(open_sealed(&bob, &blob).is_err());
    }
}
