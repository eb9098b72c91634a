//! Hybrid X25519 + ML-KEM-1024 key encapsulation.
//!
//! The combined secret stays safe as long as either primitive holds.
//! Ciphertext layout: `x25519_ephemeral (32) || mlkem_ciphertext (1568)`.

use super::keys::{generate_ephemeral_keypair, SharedSecret, StaticKeypair, X25519PublicKey};
use super::hkdf_derive;
use crate::error::{Error, Result};
use fips203::ml_kem_1024;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use std::fmt;
use zeroize::Zeroizing;

/// Encoded ML-KEM-1024 encapsulation key length.
pub const MLKEM_PUBLIC_KEY_SIZE: usize = ml_kem_1024::EK_LEN;

/// Encoded ML-KEM-1024 decapsulation key length.
pub const MLKEM_SECRET_KEY_SIZE: usize = ml_kem_1024::DK_LEN;

/// Encoded ML-KEM-1024 ciphertext length.
pub const MLKEM_CIPHERTEXT_SIZE: usize = ml_kem_1024::CT_LEN;

/// Total hybrid ciphertext length.
pub const HYBRID_CIPHERTEXT_SIZE: usize = 32 + MLKEM_CIPHERTEXT_SIZE;

/// Length of the combined hybrid secret.
pub const HYBRID_SECRET_SIZE: usize = 64;

const HYBRID_INFO: &[u8] = b"torlink-hybrid-kem-v1";

/// Post-quantum keypair held as encoded bytes.
pub struct MlKemKeypair {
    public: Vec<u8>,
    secret: Zeroizing<Vec<u8>>,
}

impl MlKemKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Result<Self> {
        let (ek, dk) = ml_kem_1024::KG::try_keygen()
            .map_err(|_| Error::Crypto("ML-KEM key generation failed".into()))?;
        Ok(Self {
            public: ek.into_bytes().to_vec(),
            secret: Zeroizing::new(dk.into_bytes().to_vec()),
        })
    }

    /// Restore from stored encodings. The public key is re-validated.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Result<Self> {
        decode_public(&public)?;
        if secret.len() != MLKEM_SECRET_KEY_SIZE {
            return Err(Error::InvalidKey("ML-KEM secret key length".into()));
        }
        Ok(Self {
            public,
            secret: Zeroizing::new(secret),
        })
    }

    /// Encoded encapsulation key, safe to publish.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Encoded decapsulation key.
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for MlKemKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MlKemKeypair({}...)", hex::encode(&self.public[..8]))
    }
}

fn decode_public(bytes: &[u8]) -> Result<ml_kem_1024::EncapsKey> {
    let arr: [u8; MLKEM_PUBLIC_KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| Error::InvalidKey("ML-KEM public key length".into()))?;
    ml_kem_1024::EncapsKey::try_from_bytes(arr)
        .map_err(|_| Error::InvalidKey("ML-KEM public key".into()))
}

fn combine(classical: &[u8], post_quantum: &[u8]) -> Result<SharedSecret> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(classical.len() + post_quantum.len()));
    ikm.extend_from_slice(classical);
    ikm.extend_from_slice(post_quantum);
    let okm = hkdf_derive(None, &ikm, HYBRID_INFO, HYBRID_SECRET_SIZE)?;
    Ok(SharedSecret::from_bytes(okm.to_vec()))
}

/// Encapsulate to a peer's classical + post-quantum public keys.
///
/// Returns the combined secret (kept locally) and the ciphertext to forward.
pub fn hybrid_encapsulate(
    peer_x25519: &X25519PublicKey,
    peer_mlkem: &[u8],
) -> Result<(SharedSecret, Vec<u8>)> {
    let ek = decode_public(peer_mlkem)?;

    let eph = generate_ephemeral_keypair();
    let eph_public = *eph.public_key();
    let classical = eph.diffie_hellman(peer_x25519);

    let (ssk, ct) = ek
        .try_encaps()
        .map_err(|_| Error::Crypto("ML-KEM encapsulation failed".into()))?;
    let pq = Zeroizing::new(ssk.into_bytes());

    let secret = combine(classical.as_bytes(), &pq[..])?;

    let mut ciphertext = Vec::with_capacity(HYBRID_CIPHERTEXT_SIZE);
    ciphertext.extend_from_slice(eph_public.as_bytes());
    ciphertext.extend_from_slice(&ct.into_bytes());
    Ok((secret, ciphertext))
}

/// Recover the combined secret from a hybrid ciphertext.
pub fn hybrid_decapsulate(
    own_x25519: &StaticKeypair,
    own_mlkem: &MlKemKeypair,
    ciphertext: &[u8],
) -> Result<SharedSecret> {
    if ciphertext.len() != HYBRID_CIPHERTEXT_SIZE {
        return Err(Error::Crypto("hybrid ciphertext length".into()));
    }
    let (eph_bytes, kem_bytes) = ciphertext.split_at(32);
    let eph_public = X25519PublicKey::from_slice(eph_bytes)?;
    let classical = own_x25519.diffie_hellman(&eph_public);

    let dk_arr: [u8; MLKEM_SECRET_KEY_SIZE] = own_mlkem
        .secret_bytes()
        .try_into()
        .map_err(|_| Error::InvalidKey("ML-KEM secret key length".into()))?;
    let dk = ml_kem_1024::DecapsKey::try_from_bytes(dk_arr)
        .map_err(|_| Error::InvalidKey("ML-KEM secret key".into()))?;
    let ct_arr: [u8; MLKEM_CIPHERTEXT_SIZE] = kem_bytes
        .try_into()
        .map_err(|_| Error::Crypto("ML-KEM ciphertext length".into()))?;
    let ct = ml_kem_1024::CipherText::try_from_bytes(ct_arr)
        .map_err(|_| Error::Crypto("ML-KEM ciphertext".into()))?;

    let ssk = dk
        .try_decaps(&ct)
        .map_err(|_| Error::Crypto("ML-KEM decapsulation failed".into()))?;
    let pq = Zeroizing::new(ssk.into_bytes());

    combine(classical.as_bytes(), &pq[..])
}

/// Classical-only agreement for peers that published no post-quantum key.
pub fn classical_agreement(own_x25519: &StaticKeypair, peer_x25519: &X25519PublicKey) -> Result<SharedSecret> {
    let dh = own_x25519.diffie_hellman(peer_x25519);
    let okm = hkdf_derive(None, dh.as_bytes(), b"torlink-classical-v1", HYBRID_SECRET_SIZE)?;
    Ok(SharedSecret::from_bytes(okm.to_vec()))
}
