//! torlink command-line driver
//!
//! Runs the contact handshake and delivery engine against a local data
//! directory and a Tor SOCKS proxy.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// torlink - friend requests and message delivery over Tor
#[derive(Parser)]
#[command(name = "torlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.torlink")]
    data_dir: String,

    /// Engine configuration (JSON)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local identity
    Init {
        /// Display name shown to contacts
        #[arg(short, long)]
        name: String,

        /// Onion address of the messaging service
        #[arg(short, long)]
        address: String,

        /// Onion address for call signalling (defaults to --address)
        #[arg(long)]
        voice_address: Option<String>,

        /// Onion address for friend requests (defaults to --address)
        #[arg(long)]
        friend_request_address: Option<String>,

        /// Replace an existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Show identity, fingerprint and PIN
    Identity,

    /// Send a friend request
    Request {
        /// Peer's friend-request address
        address: String,

        /// PIN the peer shared with you
        pin: String,
    },

    /// List friend requests
    Requests,

    /// Accept an incoming friend request
    Accept {
        /// Request id
        id: i64,
    },

    /// Reject an incoming friend request
    Reject {
        /// Request id
        id: i64,
    },

    /// Resend an outgoing friend request
    Resend {
        /// Request id
        id: i64,
    },

    /// List contacts
    Contacts,

    /// Mark a contact as verified
    Trust {
        /// Contact id
        contact: i64,

        /// Clear the flag instead
        #[arg(long)]
        undo: bool,
    },

    /// Block a contact
    Block {
        /// Contact id
        contact: i64,

        /// Unblock instead
        #[arg(long)]
        undo: bool,
    },

    /// Delete a contact and its conversation
    Remove {
        /// Contact id
        contact: i64,
    },

    /// Send a text message
    Send {
        /// Contact id
        contact: i64,

        /// Message text
        message: String,
    },

    /// Show delivery state, pending entries and recent messages
    Inbox {
        /// Contact id
        contact: i64,

        /// Number of messages to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Fetch a message waiting for manual download
    Download {
        /// Inbox entry id
        entry: i64,
    },

    /// Run the retry worker (and optionally the listeners) until Ctrl-C
    Worker {
        /// Local address the onion services forward to; enables listening
        #[arg(long)]
        listen: Option<String>,
    },

    /// Delete expired skipped message keys
    Sweep,

    /// Reset a contact's key chain counters (DANGEROUS)
    #[cfg(any(debug_assertions, feature = "dangerous-debug"))]
    ResetCounters {
        /// Contact id
        contact: i64,

        /// Confirm you understand both sides must reset together
        #[arg(long)]
        i_understand: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init {
            name,
            address,
            voice_address,
            friend_request_address,
            force,
        } => {
            commands::init(
                &data_dir,
                config,
                &name,
                &address,
                voice_address.as_deref(),
                friend_request_address.as_deref(),
                force,
            )?;
        }
        Commands::Identity => commands::show_identity(&data_dir)?,
        Commands::Request { address, pin } => {
            commands::request(&data_dir, config, &address, &pin).await?;
        }
        Commands::Requests => commands::list_requests(&data_dir, config)?,
        Commands::Accept { id } => commands::accept(&data_dir, config, id).await?,
        Commands::Reject { id } => commands::reject(&data_dir, config, id)?,
        Commands::Resend { id } => commands::resend(&data_dir, config, id).await?,
        Commands::Contacts => commands::list_contacts(&data_dir, config)?,
        Commands::Trust { contact, undo } => {
            commands::set_trusted(&data_dir, config, contact, !undo)?;
        }
        Commands::Block { contact, undo } => {
            commands::set_blocked(&data_dir, config, contact, !undo)?;
        }
        Commands::Remove { contact } => commands::remove_contact(&data_dir, config, contact)?,
        Commands::Send { contact, message } => {
            commands::send(&data_dir, config, contact, &message).await?;
        }
        Commands::Inbox { contact, limit } => {
            commands::inbox(&data_dir, config, contact, limit)?;
        }
        Commands::Download { entry } => commands::download(&data_dir, config, entry).await?,
        Commands::Worker { listen } => {
            commands::run_worker(&data_dir, config, listen.as_deref()).await?;
        }
        Commands::Sweep => commands::sweep(&data_dir, config)?,
        #[cfg(any(debug_assertions, feature = "dangerous-debug"))]
        Commands::ResetCounters {
            contact,
            i_understand,
        } => {
            commands::reset_counters(&data_dir, config, contact, i_understand).await?;
        }
    }

    Ok(())
}
