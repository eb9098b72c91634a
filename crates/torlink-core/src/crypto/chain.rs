//! Symmetric KDFs behind the per-contact key chain.
//!
//! ```text
//! root        = HKDF-SHA256(shared_secret, info = "torlink-root-v1")
//! chain_low   = HMAC(root, 0x03)   // sender with the lower messaging address
//! chain_high  = HMAC(root, 0x04)   // sender with the higher messaging address
//! next_chain  = HMAC(chain, 0x01)
//! message_key = HMAC(chain, 0x02)
//! ```
//!
//! Both ends compute the same pair of chains and pick opposite halves, so
//! no negotiation is needed beyond the handshake secret.

use super::hkdf_derive;
use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Size of every chain and message key.
pub const CHAIN_KEY_SIZE: usize = 32;

/// Chain key (32 bytes), zeroized on drop.
pub type ChainKey = Zeroizing<[u8; CHAIN_KEY_SIZE]>;

const ROOT_INFO: &[u8] = b"torlink-root-v1";
const NEXT_CHAIN: u8 = 0x01;
const MESSAGE_KEY: u8 = 0x02;
const CHAIN_LOW: u8 = 0x03;
const CHAIN_HIGH: u8 = 0x04;

fn hmac_byte(key: &[u8], byte: u8) -> Result<ChainKey> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("hmac key".into()))?;
    mac.update(&[byte]);
    let mut out = Zeroizing::new([0u8; CHAIN_KEY_SIZE]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Root key from the handshake shared secret.
pub fn derive_root_key(shared_secret: &[u8]) -> Result<ChainKey> {
    let okm = hkdf_derive(None, shared_secret, ROOT_INFO, CHAIN_KEY_SIZE)?;
    let mut root = Zeroizing::new([0u8; CHAIN_KEY_SIZE]);
    root.copy_from_slice(&okm);
    Ok(root)
}

/// `(send_chain, recv_chain)` for the side owning `own_address`.
///
/// Fails if both addresses are equal, since the halves would collide.
pub fn direction_chain_keys(
    root: &[u8],
    own_address: &str,
    peer_address: &str,
) -> Result<(ChainKey, ChainKey)> {
    let low = hmac_byte(root, CHAIN_LOW)?;
    let high = hmac_byte(root, CHAIN_HIGH)?;
    match own_address.cmp(peer_address) {
        std::cmp::Ordering::Less => Ok((low, high)),
        std::cmp::Ordering::Greater => Ok((high, low)),
        std::cmp::Ordering::Equal => Err(Error::InvalidKey("chain addresses must differ".into())),
    }
}

/// One chain step: `(next_chain_key, message_key)`.
pub fn kdf_chain(chain_key: &[u8]) -> Result<(ChainKey, ChainKey)> {
    Ok((hmac_byte(chain_key, NEXT_CHAIN)?, hmac_byte(chain_key, MESSAGE_KEY)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directions_mirror() {
        let root = derive_root_key(&[9u8; 64]).expect("root");
        let (a_send, a_recv) = direction_chain_keys(&*root, "aaa.onion", "bbb.onion").expect("a");
        let (b_send, b_recv) = direction_chain_keys(&*root, "bbb.onion", "aaa.onion").expect("b");
        assert_eq!(*a_send, *b_recv);
        assert_eq!(*a_recv, *b_send);
        assert_ne!(*a_send, *a_recv);
    }

    #[test]
    fn test_same_address_rejected() {
        let root = derive_root_key(&[9u8; 64]).expect("root");
        assert!(direction_chain_keys(&*root, "aaa.onion", "aaa.onion").is_err());
    }

    #[test]
    fn test_kdf_chain_deterministic() {
        let ck = [3u8; CHAIN_KEY_SIZE];
        let (n1, m1) = kdf_chain(&ck).expect("step");
        let (n2, m2) = kdf_chain(&ck).expect("step");
        assert_eq!(*n1, *n2);
        assert_eq!(*m1, *m2);
        assert_ne!(*n1, *m1);
    }
}
