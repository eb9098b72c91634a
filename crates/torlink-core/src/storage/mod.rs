//! Local persistence.
//!
//! Every durable piece of protocol state lives in one SQLite database:
//! identity, contacts, in-flight handshakes, key chains, the ping inbox,
//! plaintext messages and the outbox drained by the retry worker.
//!
//! ## Storage Rules
//!
//! - Outbound items are written before any network I/O
//! - Claims are single conditional UPDATEs, never read-then-write
//! - Deleting a contact cascades to everything derived from it

mod contacts;
mod database;
mod identity;
mod inbox;
mod keychains;
mod messages;
mod outbox;
mod requests;
mod schema;

pub use contacts::{Contact, ContactStore, FriendshipStatus, NewContact};
pub use database::{Database, DatabaseConfig};
pub use identity::IdentityStore;
pub use inbox::{InboxStore, PingInboxEntry, PingState};
pub use keychains::{KeyChainRecord, KeyChainStore};
pub use messages::{MessageStore, NewMessage, StoredMessage};
pub use outbox::{NewOutboxItem, Outbox, OutboxItem, OutboxKind, OutboxStatus};
pub use requests::{PendingFriendRequest, RequestDirection, RequestStatus, RequestStore};
pub use schema::SCHEMA_VERSION;

#[cfg(test)]
pub(crate) use contacts::test_support as contact_support;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "torlink.db";

/// Current Unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
