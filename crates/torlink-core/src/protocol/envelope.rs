//! Message envelope.
//!
//! ```text
//! ┌─────────┬────────────────┬──────────┬─────────────────────┐
//! │ Version │ Counter (u64BE)│  Nonce   │  Ciphertext || Tag  │
//! │ (1 byte)│   (8 bytes)    │(12 bytes)│     (variable)      │
//! └─────────┴────────────────┴──────────┴─────────────────────┘
//! ```
//!
//! The version and counter are authenticated as associated data.

use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Current envelope version.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Version plus counter.
pub const ENVELOPE_HEADER_SIZE: usize = 1 + 8;

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender's chain position for this message.
    pub counter: u64,
    /// AEAD nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with tag.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// The authenticated header bytes for `counter`.
    pub fn header(counter: u64) -> [u8; ENVELOPE_HEADER_SIZE] {
        let mut header = [0u8; ENVELOPE_HEADER_SIZE];
        header[0] = ENVELOPE_VERSION;
        header[1..].copy_from_slice(&counter.to_be_bytes());
        header
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&Self::header(self.counter));
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_HEADER_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(Error::Protocol("envelope too short".into()));
        }
        if bytes[0] != ENVELOPE_VERSION {
            return Err(Error::UnsupportedFormat);
        }
        let counter = u64::from_be_bytes(
            bytes[1..ENVELOPE_HEADER_SIZE]
                .try_into()
                .map_err(|_| Error::Protocol("counter".into()))?,
        );
        let nonce: [u8; NONCE_SIZE] = bytes[ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + NONCE_SIZE]
            .try_into()
            .map_err(|_| Error::Protocol("nonce".into()))?;
        Ok(Self {
            counter,
            nonce,
            ciphertext: bytes[ENVELOPE_HEADER_SIZE + NONCE_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let env = Envelope {
            counter: 0x0102,
            nonce: [7u8; NONCE_SIZE],
            ciphertext: vec![9u8; TAG_SIZE + 3],
        };
        let bytes = env.to_bytes();
        assert_eq!(bytes[0], ENVELOPE_VERSION);
        assert_eq!(&bytes[1..9], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(Envelope::from_bytes(&bytes).expect("decode"), env);
    }

    #[test]
    fn test_rejects_short_and_unknown_version() {
        assert!(Envelope::from_bytes(&[ENVELOPE_VERSION; 10]).is_err());
        let mut bytes = Envelope {
            counter: 1,
            nonce: [0u8; NONCE_SIZE],
            ciphertext: vec![0u8; TAG_SIZE],
        }
        .to_bytes();
        bytes[0] = 0x02;
        assert!(matches!(Envelope::from_bytes(&bytes), Err(Error::UnsupportedFormat)));
    }
}
