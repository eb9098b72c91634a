//! Database schema definitions.

/// Schema version recorded in `schema_meta`.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the database schema. Idempotent.
pub const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);

-- Single local identity
CREATE TABLE IF NOT EXISTS local_identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    display_name TEXT NOT NULL,
    signing_secret BLOB NOT NULL,
    x25519_secret BLOB NOT NULL,
    mlkem_public BLOB NOT NULL,
    mlkem_secret BLOB NOT NULL,
    messaging_address TEXT NOT NULL,
    voice_address TEXT NOT NULL,
    friend_request_address TEXT NOT NULL,
    backup_reference TEXT,
    pin TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Confirmed peers
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    signing_public_key BLOB NOT NULL,
    x25519_public_key BLOB NOT NULL,
    kyber_public_key BLOB,
    messaging_address TEXT NOT NULL UNIQUE,
    voice_address TEXT NOT NULL,
    friend_request_address TEXT NOT NULL,
    trusted INTEGER NOT NULL DEFAULT 0,
    blocked INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- In-flight handshakes, one per (direction, peer)
CREATE TABLE IF NOT EXISTS pending_friend_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    direction INTEGER NOT NULL,
    status INTEGER NOT NULL,
    peer_address TEXT NOT NULL,
    payload BLOB NOT NULL,
    sending_since INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(direction, peer_address)
);

CREATE INDEX IF NOT EXISTS idx_requests_status ON pending_friend_requests(status);

-- Per-contact ratchet state
CREATE TABLE IF NOT EXISTS key_chains (
    contact_id INTEGER PRIMARY KEY REFERENCES contacts(id) ON DELETE CASCADE,
    root_key BLOB NOT NULL,
    send_chain_key BLOB NOT NULL,
    recv_chain_key BLOB NOT NULL,
    send_counter INTEGER NOT NULL,
    recv_counter INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS skipped_keys (
    contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
    counter INTEGER NOT NULL,
    message_key BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (contact_id, counter)
);

CREATE INDEX IF NOT EXISTS idx_skipped_created ON skipped_keys(created_at);

-- Received pings awaiting materialisation
CREATE TABLE IF NOT EXISTS ping_inbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
    ping_id TEXT NOT NULL UNIQUE,
    state INTEGER NOT NULL,
    content_type INTEGER NOT NULL,
    wire_bytes BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_inbox_contact_state ON ping_inbox(contact_id, state);

-- Plaintext messages
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
    ping_id TEXT NOT NULL UNIQUE,
    outgoing INTEGER NOT NULL,
    content_type INTEGER NOT NULL,
    body BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_contact ON messages(contact_id, created_at);

-- Persisted outbound frames
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind INTEGER NOT NULL,
    dedupe_key TEXT NOT NULL UNIQUE,
    address TEXT NOT NULL,
    port INTEGER NOT NULL,
    frame BLOB NOT NULL,
    request_id INTEGER,
    contact_id INTEGER,
    status INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(status, next_retry_at);
CREATE INDEX IF NOT EXISTS idx_outbox_request ON outbox(request_id);
"#;
