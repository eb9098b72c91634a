//! Engine configuration.
//!
//! All knobs live in [`EngineConfig`], which is plain data with sensible
//! defaults. Hosts either construct it directly or load it from JSON.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Seconds a friend request may stay in SENDING before it is failed.
/// Send attempts do not extend the window.
pub const DEFAULT_STALE_REQUEST_SECS: i64 = 3 * 60;

/// Skipped message keys are swept after this many seconds (30 days).
pub const DEFAULT_SKIPPED_KEY_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Upper bound on keys derived for a single out-of-order gap.
pub const DEFAULT_MAX_SKIP: u64 = 1000;

/// Delivered outbox items are deleted after this many seconds
/// (7 days).
pub const DEFAULT_OUTBOX_RETENTION_SECS: i64 = 7 * 24 * 60 * 60;

/// A download that has not produced its message after this many seconds
/// falls back to FAILED_TEMP.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: i64 = 5 * 60;

/// PIN length policy for the out-of-band handshake secret.
///
/// This is a local setting. Nothing on the wire says which mode a peer
/// used; the user picks the mode that matches what they were given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    /// 10-digit PINs.
    #[default]
    Standard,
    /// 6-digit PINs from older manual-entry clients.
    Legacy,
}

impl PinMode {
    /// Number of digits a PIN must have in this mode.
    pub fn digits(self) -> usize {
        match self {
            PinMode::Standard => 10,
            PinMode::Legacy => 6,
        }
    }

    /// Check that `pin` is all ASCII digits of the right length.
    pub fn validate_pin(self, pin: &str) -> Result<()> {
        if pin.len() == self.digits() && pin.bytes().all(|b| b.is_ascii_digit()) {
            Ok(())
        } else {
            Err(Error::InvalidPin)
        }
    }
}

/// Whether incoming pings are fetched without user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    /// Fetch as soon as a ping arrives.
    #[default]
    Auto,
    /// Device-protection mode: wait for an explicit tap.
    Manual,
}

/// Retry worker schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Worker tick interval.
    pub interval_secs: u64,
    /// First backoff delay.
    pub initial_delay_secs: i64,
    /// Backoff ceiling.
    pub max_delay_secs: i64,
    /// Attempts before an outbox item is marked FAILED, and before a
    /// failing download stops retrying and waits for the user.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            initial_delay_secs: 30,
            max_delay_secs: 3600,
            max_attempts: 10,
        }
    }
}

impl RetryConfig {
    /// Backoff delay after `attempts` failures: `min(initial * 2^attempts, max)`.
    pub fn backoff_secs(&self, attempts: u32) -> i64 {
        let factor = 1i64.checked_shl(attempts.min(32)).unwrap_or(i64::MAX);
        self.initial_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
    }
}

/// Anonymity transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// SOCKS5 proxy address of the local Tor daemon.
    pub socks_addr: SocketAddr,
    /// Bound on establishing a circuit and writing one frame.
    pub connect_timeout_secs: u64,
    /// Bound on waiting for the gate to open before a send.
    pub gate_timeout_secs: u64,
    /// Virtual port for pings, pongs and messages.
    pub message_port: u16,
    /// Virtual port for handshake payloads.
    pub friend_request_port: u16,
    /// Virtual port for acknowledgements.
    pub ack_port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socks_addr: SocketAddr::from(([127, 0, 0, 1], 9050)),
            connect_timeout_secs: 60,
            gate_timeout_secs: 30,
            message_port: 9150,
            friend_request_port: 9151,
            ack_port: 9153,
        }
    }
}

impl TransportConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Gate wait as a [`Duration`].
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PIN length policy.
    pub pin_mode: PinMode,
    /// Auto or manual ping handling.
    pub download_mode: DownloadMode,
    /// Staleness window for SENDING friend requests.
    pub stale_request_secs: i64,
    /// Lifetime of cached skipped keys.
    pub skipped_key_ttl_secs: i64,
    /// Maximum gap a single receive may skip.
    pub max_skip: u64,
    /// Stall window for DOWNLOAD_QUEUED and DOWNLOADING entries.
    pub download_timeout_secs: i64,
    /// How long delivered outbox items are kept.
    pub outbox_retention_secs: i64,
    /// Retry worker schedule.
    pub retry: RetryConfig,
    /// Transport settings.
    pub transport: TransportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pin_mode: PinMode::default(),
            download_mode: DownloadMode::default(),
            stale_request_secs: DEFAULT_STALE_REQUEST_SECS,
            skipped_key_ttl_secs: DEFAULT_SKIPPED_KEY_TTL_SECS,
            max_skip: DEFAULT_MAX_SKIP,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            outbox_retention_secs: DEFAULT_OUTBOX_RETENTION_SECS,
            retry: RetryConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the engine.
    pub fn validate(&self) -> Result<()> {
        if self.retry.interval_secs == 0 {
            return Err(Error::Config("retry interval must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be non-zero".into()));
        }
        if self.retry.initial_delay_secs <= 0
            || self.retry.initial_delay_secs > self.retry.max_delay_secs
        {
            return Err(Error::Config("initial delay must be in (0, max_delay]".into()));
        }
        if self.stale_request_secs <= 0
            || self.skipped_key_ttl_secs <= 0
            || self.download_timeout_secs <= 0
            || self.outbox_retention_secs <= 0
        {
            return Err(Error::Config("windows must be positive".into()));
        }
        if self.max_skip == 0 {
            return Err(Error::Config("max_skip must be non-zero".into()));
        }
        if self.transport.connect_timeout_secs == 0 || self.transport.gate_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.stale_request_secs, 180);
        assert_eq!(config.transport.message_port, 9150);
        assert_eq!(config.pin_mode, PinMode::Standard);
    }

    #[test]
    fn test_pin_modes() {
        PinMode::Standard.validate_pin("1234567890").expect("10 digits");
        assert!(PinMode::Standard.validate_pin("123456").is_err());
        PinMode::Legacy.validate_pin("123456").expect("6 digits");
        assert!(PinMode::Legacy.validate_pin("1234567890").is_err());
        assert!(PinMode::Standard.validate_pin("12345abcde").is_err());
    }

    #[test]
    fn test_backoff() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_secs(0), 30);
        assert_eq!(retry.backoff_secs(1), 60);
        assert_eq!(retry.backoff_secs(3), 240);
        assert_eq!(retry.backoff_secs(10), 3600);
        assert_eq!(retry.backoff_secs(200), 3600);
    }

    #[test]
    fn test_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"pin_mode":"legacy","retry":{"max_attempts":3}}"#)
                .expect("parse");
        assert_eq!(config.pin_mode, PinMode::Legacy);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.interval_secs, 120);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = EngineConfig::default();
        config.retry.initial_delay_secs = 7200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_outbox_retention_is_its_own_window() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"outbox_retention_secs":60}"#).expect("parse");
        assert_eq!(config.outbox_retention_secs, 60);
        assert_eq!(config.skipped_key_ttl_secs, DEFAULT_SKIPPED_KEY_TTL_SECS);

        let mut config = EngineConfig::default();
        config.outbox_retention_secs = 0;
        assert!(config.validate().is_err());
    }
}
