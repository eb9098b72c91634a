//! CLI command implementations.

use anyhow::{bail, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use torlink_core::{
    identity::{IdentityAddresses, LocalIdentity, OnionAddress},
    protocol::ContentType,
    storage::{
        now, Database, DatabaseConfig, FriendshipStatus, IdentityStore, RequestDirection,
        DEFAULT_DB_NAME,
    },
    transport::{FrameListener, TorTransport},
    DeliveryMachine, EngineConfig, EngineContext, HandshakeEngine, RetryWorker, Router,
};
use tracing::info;

fn open_database(data_dir: &str) -> Result<Database> {
    let config = DatabaseConfig {
        path: format!("{}/{}", data_dir, DEFAULT_DB_NAME),
        in_memory: false,
    };
    Database::open(&config).context("Failed to open database")
}

fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let path = shellexpand::tilde(path).to_string();
            EngineConfig::load(&path).with_context(|| format!("Failed to load config {}", path))
        }
        None => Ok(EngineConfig::default()),
    }
}

fn load_identity(db: &Database) -> Result<LocalIdentity> {
    IdentityStore::new(db.clone())
        .load()
        .context("Failed to load identity")?
        .context("No identity found. Run 'torlink init' first.")
}

/// Open everything a command needs to talk to peers.
fn open_engine(data_dir: &str, config_path: Option<&str>) -> Result<EngineContext> {
    let config = load_config(config_path)?;
    let db = open_database(data_dir)?;
    let identity = load_identity(&db)?;
    let transport = Arc::new(TorTransport::new(&config.transport));
    EngineContext::new(db, config, identity, transport).context("Failed to start engine")
}

fn format_time(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Initialize a new identity.
pub fn init(
    data_dir: &str,
    config_path: Option<&str>,
    name: &str,
    address: &str,
    voice_address: Option<&str>,
    friend_request_address: Option<&str>,
    force: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let messaging = OnionAddress::parse(address).context("Invalid messaging address")?;
    let voice = match voice_address {
        Some(a) => OnionAddress::parse(a).context("Invalid voice address")?,
        None => messaging.clone(),
    };
    let friend_request = match friend_request_address {
        Some(a) => OnionAddress::parse(a).context("Invalid friend-request address")?,
        None => messaging.clone(),
    };

    let db = open_database(data_dir)?;
    let store = IdentityStore::new(db);
    if store.exists()? && !force {
        bail!("Identity already exists. Use --force to overwrite.");
    }

    let identity = LocalIdentity::generate(
        name,
        IdentityAddresses {
            messaging,
            voice,
            friend_request,
        },
        config.pin_mode,
    )
    .context("Failed to generate identity")?;
    store.save(&identity).context("Failed to store identity")?;

    println!("Identity created.");
    println!();
    print_identity(&identity);
    println!();
    println!("Share your friend-request address and PIN with contacts out of band.");
    Ok(())
}

fn print_identity(identity: &LocalIdentity) {
    println!("Name:           {}", identity.display_name);
    println!("Fingerprint:    {}", identity.fingerprint());
    println!("Messaging:      {}", identity.addresses.messaging);
    println!("Voice:          {}", identity.addresses.voice);
    println!("Friend request: {}", identity.addresses.friend_request);
    println!("PIN:            {}", identity.pin());
}

/// Show the local identity.
pub fn show_identity(data_dir: &str) -> Result<()> {
    let db = open_database(data_dir)?;
    let identity = load_identity(&db)?;
    print_identity(&identity);
    Ok(())
}

/// Send a friend request.
pub async fn request(
    data_dir: &str,
    config_path: Option<&str>,
    address: &str,
    pin: &str,
) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let id = HandshakeEngine::new(ctx)
        .initiate(address, pin)
        .await
        .context("Failed to send friend request")?;
    println!("Friend request {} queued.", id);
    println!("Run 'torlink worker' to keep retrying while the peer is offline.");
    Ok(())
}

/// List friend requests.
pub fn list_requests(data_dir: &str, config_path: Option<&str>) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let requests = HandshakeEngine::new(ctx)
        .list_requests()
        .context("Failed to list requests")?;

    if requests.is_empty() {
        println!("No friend requests.");
        return Ok(());
    }

    println!("{:<6} {:<10} {:<12} {:<20} Peer", "ID", "Direction", "Status", "Updated");
    for request in requests {
        let direction = match request.direction {
            RequestDirection::Outgoing => "outgoing",
            RequestDirection::Incoming => "incoming",
        };
        println!(
            "{:<6} {:<10} {:<12} {:<20} {}",
            request.id,
            direction,
            format!("{:?}", request.status),
            format_time(request.updated_at),
            request.peer_address
        );
    }
    Ok(())
}

/// Accept an incoming friend request.
pub async fn accept(data_dir: &str, config_path: Option<&str>, id: i64) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let reply = HandshakeEngine::new(ctx)
        .accept(id)
        .await
        .context("Failed to accept friend request")?;
    println!("Accepted. Reply queued as request {}.", reply);
    println!("The contact appears once the peer confirms.");
    Ok(())
}

/// Reject an incoming friend request.
pub fn reject(data_dir: &str, config_path: Option<&str>, id: i64) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    HandshakeEngine::new(ctx)
        .reject(id)
        .context("Failed to reject friend request")?;
    println!("Rejected request {}.", id);
    Ok(())
}

/// Resend an outgoing friend request.
pub async fn resend(data_dir: &str, config_path: Option<&str>, id: i64) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let delivered = HandshakeEngine::new(ctx)
        .resend(id)
        .await
        .context("Failed to resend friend request")?;
    if delivered {
        println!("Request {} delivered.", id);
    } else {
        println!("Request {} queued; the peer is not reachable yet.", id);
    }
    Ok(())
}

/// List contacts.
pub fn list_contacts(data_dir: &str, config_path: Option<&str>) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let contacts = ctx.contacts().list().context("Failed to list contacts")?;

    if contacts.is_empty() {
        println!("No contacts.");
        return Ok(());
    }

    println!("{:<6} {:<20} {:<10} {:<8} Address", "ID", "Name", "Status", "Flags");
    for contact in contacts {
        let status = match contact.status {
            FriendshipStatus::Pending => "pending",
            FriendshipStatus::Confirmed => "confirmed",
        };
        let mut flags = String::new();
        if contact.trusted {
            flags.push('T');
        }
        if contact.blocked {
            flags.push('B');
        }
        println!(
            "{:<6} {:<20} {:<10} {:<8} {}",
            contact.id, contact.display_name, status, flags, contact.messaging_address
        );
    }
    Ok(())
}

/// Set or clear a contact's trust flag.
pub fn set_trusted(data_dir: &str, config_path: Option<&str>, contact_id: i64, trusted: bool) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    HandshakeEngine::new(ctx)
        .set_trusted(contact_id, trusted)
        .context("Failed to update contact")?;
    println!("Contact {} {}.", contact_id, if trusted { "trusted" } else { "untrusted" });
    Ok(())
}

/// Block or unblock a contact.
pub fn set_blocked(data_dir: &str, config_path: Option<&str>, contact_id: i64, blocked: bool) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    HandshakeEngine::new(ctx)
        .set_blocked(contact_id, blocked)
        .context("Failed to update contact")?;
    println!("Contact {} {}.", contact_id, if blocked { "blocked" } else { "unblocked" });
    Ok(())
}

/// Delete a contact and everything derived from it.
pub fn remove_contact(data_dir: &str, config_path: Option<&str>, contact_id: i64) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    HandshakeEngine::new(ctx)
        .remove_contact(contact_id)
        .context("Failed to remove contact")?;
    println!("Contact {} removed.", contact_id);
    Ok(())
}

/// Send a text message.
pub async fn send(
    data_dir: &str,
    config_path: Option<&str>,
    contact_id: i64,
    message: &str,
) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let ping_id = DeliveryMachine::new(ctx.clone())
        .send_message(contact_id, ContentType::Text, message.as_bytes())
        .await
        .context("Failed to send message")?;

    let delivered = ctx
        .outbox()
        .get_by_key(&format!("ping:{}", ping_id))?
        .map(|item| !item.status.is_undelivered())
        .unwrap_or(false);
    if delivered {
        println!("Ping {} delivered; the message follows when the peer fetches it.", ping_id);
    } else {
        println!("Ping {} queued.", ping_id);
    }
    Ok(())
}

/// Show a contact's delivery state, pending entries and recent messages.
pub fn inbox(data_dir: &str, config_path: Option<&str>, contact_id: i64, limit: u32) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let contact = ctx
        .contacts()
        .get(contact_id)?
        .with_context(|| format!("Contact {} not found", contact_id))?;
    let delivery = DeliveryMachine::new(ctx.clone());

    println!("Contact:   {} ({})", contact.display_name, contact.id);
    println!("State:     {:?}", delivery.contact_state(contact_id)?);
    println!("Indicator: {:?}", delivery.indicator(contact_id)?);

    let pending = delivery.visible_pending(contact_id)?;
    if !pending.is_empty() {
        println!();
        println!("{:<6} {:<16} {:<9} Received", "Entry", "State", "Attempts");
        for entry in pending {
            println!(
                "{:<6} {:<16} {:<9} {}",
                entry.id,
                format!("{:?}", entry.state),
                entry.attempts,
                format_time(entry.created_at)
            );
        }
    }

    let messages = ctx.messages().list_for_contact(contact_id, limit)?;
    if !messages.is_empty() {
        println!();
        for message in messages {
            if ContentType::from_byte(message.content_type).map_or(true, |t| t.is_silent()) {
                continue;
            }
            let arrow = if message.outgoing { ">" } else { "<" };
            println!(
                "[{}] {} {}",
                format_time(message.created_at),
                arrow,
                String::from_utf8_lossy(&message.body)
            );
        }
    }
    Ok(())
}

/// Fetch a message waiting for manual download.
pub async fn download(data_dir: &str, config_path: Option<&str>, entry_id: i64) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    DeliveryMachine::new(ctx)
        .manual_download(entry_id)
        .await
        .context("Failed to start download")?;
    println!("Download of entry {} started.", entry_id);
    println!("The message is stored once the sender delivers it to your listener.");
    Ok(())
}

/// Run the retry worker, and the listeners and router if `listen` is set,
/// until Ctrl-C.
pub async fn run_worker(data_dir: &str, config_path: Option<&str>, listen: Option<&str>) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let (stop, shutdown) = watch::channel(false);
    let mut tasks = Vec::new();

    if let Some(listen) = listen {
        let ip: IpAddr = listen
            .parse()
            .with_context(|| format!("Invalid listen address {}", listen))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = &ctx.config().transport;
        for port in [transport.message_port, transport.friend_request_port, transport.ack_port] {
            let listener = FrameListener::bind(SocketAddr::new(ip, port), port)
                .await
                .with_context(|| format!("Failed to listen on {}:{}", ip, port))?;
            tasks.push(tokio::spawn(listener.run(tx.clone(), shutdown.clone())));
        }
        drop(tx);
        tasks.push(tokio::spawn(Router::new(ctx.clone()).run(rx, shutdown.clone())));
    }

    let mut events = ctx.subscribe();
    tasks.push(tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    }));

    let worker = RetryWorker::spawn(ctx.clone());
    info!(identity = %ctx.identity().addresses.messaging, "running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    info!("shutting down");
    let _ = stop.send(true);
    worker.shutdown().await;
    for task in tasks {
        task.abort();
    }
    Ok(())
}

/// Delete expired skipped message keys.
pub fn sweep(data_dir: &str, config_path: Option<&str>) -> Result<()> {
    let ctx = open_engine(data_dir, config_path)?;
    let swept = ctx
        .keychain()
        .sweep_skipped_keys(now())
        .context("Failed to sweep skipped keys")?;
    let ghosts = DeliveryMachine::new(ctx)
        .reconcile_ghosts()
        .context("Failed to reconcile inbox")?;
    println!("Swept {} expired skipped keys, cleared {} stale inbox entries.", swept, ghosts);
    Ok(())
}

/// Reset a contact's key chain counters.
#[cfg(any(debug_assertions, feature = "dangerous-debug"))]
pub async fn reset_counters(
    data_dir: &str,
    config_path: Option<&str>,
    contact_id: i64,
    i_understand: bool,
) -> Result<()> {
    if !i_understand {
        bail!(
            "This breaks the conversation unless the peer resets at the same time. \
             Re-run with --i-understand to proceed."
        );
    }
    let ctx = open_engine(data_dir, config_path)?;
    let contact = ctx
        .contacts()
        .get(contact_id)?
        .with_context(|| format!("Contact {} not found", contact_id))?;
    ctx.keychain()
        .reset_counters_dangerous(
            contact_id,
            ctx.identity().addresses.messaging.as_str(),
            &contact.messaging_address,
        )
        .await
        .context("Failed to reset counters")?;
    println!("Counters for {} reset to zero.", contact.display_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_default_config_without_path() {
        let config = load_config(None).expect("config");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8 path");
        let signing = torlink_core::crypto::SigningKeypair::generate();
        let address = OnionAddress::from_public_key(&signing.verifying_key()).to_string();

        init(data_dir, None, "alice", &address, None, None, false).expect("first init");
        assert!(Path::new(&format!("{}/{}", data_dir, DEFAULT_DB_NAME)).exists());
        assert!(init(data_dir, None, "alice", &address, None, None, false).is_err());
        init(data_dir, None, "alice", &address, None, None, true).expect("forced init");
    }

    #[test]
    fn test_show_identity_needs_only_the_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8 path");
        assert!(show_identity(data_dir).is_err());

        let signing = torlink_core::crypto::SigningKeypair::generate();
        let address = OnionAddress::from_public_key(&signing.verifying_key()).to_string();
        init(data_dir, None, "alice", &address, None, None, false).expect("init");
        show_identity(data_dir).expect("show");
    }

    #[test]
    fn test_init_rejects_bad_address() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_str().expect("utf8 path");
        assert!(init(data_dir, None, "alice", "not-an-onion", None, None, false).is_err());
    }
}
