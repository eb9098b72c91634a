//! # torlink core
//!
//! Contact handshake and asynchronous delivery engine for a Tor-native
//! messenger. Peers reach each other only through onion services; there
//! are no accounts and no servers in between.
//!
//! ## Core Guarantees
//!
//! - Nothing joins the contact list before both sides proved their keys
//! - Every outbound frame is persisted before the first send attempt
//! - A ping is downloaded at most once, whatever races with it
//! - One message key per counter, derived under a per-contact lock
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      router       │    retry worker     │
//! ├─────────────────────────────────────────┤
//! │  handshake  │  delivery  │  keychain    │
//! ├─────────────────────────────────────────┤
//! │  storage  │  transport  │  protocol     │
//! ├─────────────────────────────────────────┤
//! │    crypto    │       identity           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Components share one [`EngineContext`]; state changes are published as
//! [`EngineEvent`]s.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod context;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod events;
pub mod handshake;
pub mod identity;
pub mod keychain;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod storage;
pub mod transport;
pub mod worker;

pub use config::EngineConfig;
pub use context::EngineContext;
pub use delivery::{ContactDeliveryState, DeliveryMachine, Indicator};
pub use error::{Error, Result};
pub use events::{EngineEvent, HandshakeOutcome};
pub use handshake::HandshakeEngine;
pub use keychain::KeyChainManager;
pub use router::Router;
pub use worker::{RetryWorker, WorkerHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
