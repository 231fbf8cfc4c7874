//! pairlink CLI
//!
//! Thin wrapper around pairlink-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show identity and relay information
//! pairlink info
//!
//! # Print a pairing request descriptor (ship it as QR code / link)
//! pairlink pair request
//!
//! # Answer a pairing request and stay listening for messages (wallet role)
//! pairlink pair respond '<request-json>'
//!
//! # Listen for encrypted messages from a paired peer
//! pairlink listen <peer-public-key-hex>
//!
//! # Send an encrypted message to a paired peer
//! pairlink send '<descriptor-json>' "message"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pairlink_core::{Config, Identity, PairingEngine, PairingInfo, RedbStorage, select_relay};

/// pairlink - encrypted peer-to-peer messaging over chat relays
#[derive(Parser)]
#[command(name = "pairlink")]
#[command(version)]
#[command(about = "Encrypted peer-to-peer pairing and messaging over federated chat relays")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.pairlink)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Display name carried in pairing payloads
    #[arg(short, long, global = true, default_value = "pairlink")]
    name: String,

    /// Relay nodes to consider (default: built-in list)
    #[arg(long, global = true)]
    relay: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity and relay information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Pairing operations
    Pair {
        #[command(subcommand)]
        action: PairAction,
    },

    /// Listen for encrypted messages from a peer
    Listen {
        /// Peer's Ed25519 public key (hex)
        peer_public_key: String,
    },

    /// Send an encrypted message to a paired peer
    Send {
        /// Peer descriptor JSON (pairing request or response)
        descriptor: String,
        /// Message to send
        message: String,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show the local identity
    Show,
    /// Generate a new identity (WARNING: replaces existing)
    Regenerate {
        /// Confirm regeneration (required)
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PairAction {
    /// Print a fresh pairing request descriptor
    Request,
    /// Answer a pairing request (wallet role) and keep listening
    Respond {
        /// Pairing request JSON
        request: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info,pairlink_core=info",
        2 => "debug,pairlink_core=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pairlink")
}

/// Load the identity seed from `identity.key`, creating one on first run.
fn load_identity(data_dir: &PathBuf, regenerate: bool) -> Result<Identity> {
    let key_path = data_dir.join("identity.key");

    if key_path.exists() && !regenerate {
        let raw = std::fs::read_to_string(&key_path)?;
        let bytes = hex::decode(raw.trim()).context("identity.key is not valid hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity.key must hold 32 bytes"))?;
        return Ok(Identity::from_secret_bytes(&seed));
    }

    std::fs::create_dir_all(data_dir)?;
    let identity = Identity::generate()?;
    std::fs::write(&key_path, hex::encode(identity.secret_bytes()))?;
    println!("Wrote new identity to {}", key_path.display());
    Ok(identity)
}

fn parse_descriptor(raw: &str) -> Result<PairingInfo> {
    serde_json::from_str(raw).context("descriptor is not a valid pairing payload")
}

async fn started_engine(cli: &Cli, wallet: bool) -> Result<PairingEngine> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let identity = load_identity(&data_dir, false)?;
    let storage = Arc::new(RedbStorage::new(data_dir.join("pairlink.redb"))?);

    let mut config = Config::new(cli.name.clone());
    config.relay_nodes = cli.relay.clone();
    config.wallet = wallet;

    let engine = PairingEngine::with_http_nodes(config, identity, storage);
    engine.start().await?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    match &cli.command {
        Commands::Info => {
            let identity = load_identity(&data_dir, false)?;
            let relay = select_relay(&identity.public_key_hash_hex(), "0", &cli.relay)?;

            println!("pairlink v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Identity:");
            println!("  Public key:  {}", identity.public_key_hex());
            println!("  Address:     {}", identity.public_key_hash_hex());
            println!();
            println!("Relay: {}", relay);
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                let identity = load_identity(&data_dir, false)?;
                println!("Public key: {}", identity.public_key_hex());
                println!("Address:    {}", identity.public_key_hash_hex());
            }
            IdentityAction::Regenerate { force } => {
                if !*force {
                    anyhow::bail!("Refusing to replace the identity without --force");
                }
                let identity = load_identity(&data_dir, true)?;
                println!("New public key: {}", identity.public_key_hex());
            }
        },

        Commands::Pair { action } => match action {
            PairAction::Request => {
                let identity = load_identity(&data_dir, false)?;
                let mut config = Config::new(cli.name.clone());
                config.relay_nodes = cli.relay.clone();
                let storage = Arc::new(RedbStorage::new(data_dir.join("pairlink.redb"))?);

                let engine = PairingEngine::with_http_nodes(config, identity, storage);
                let request = engine.get_pairing_request_info()?;
                println!("{}", serde_json::to_string_pretty(&request)?);
            }
            PairAction::Respond { request } => {
                let request = parse_descriptor(request)?;
                let engine = started_engine(&cli, true).await?;

                engine.send_pairing_response(&request).await?;
                println!("Pairing response sent; listening for messages (ctrl-c to quit)");

                let peer_pk = request.public_key_bytes()?;
                engine
                    .listen_for_encrypted_messages(&peer_pk, |plaintext| {
                        println!("< {}", plaintext);
                    })
                    .await?;

                tokio::signal::ctrl_c().await?;
                engine.stop().await?;
            }
        },

        Commands::Listen { peer_public_key } => {
            let bytes = hex::decode(peer_public_key).context("peer key is not valid hex")?;
            let peer_pk: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("peer key must be 32 bytes"))?;

            let engine = started_engine(&cli, false).await?;
            engine
                .listen_for_encrypted_messages(&peer_pk, |plaintext| {
                    println!("< {}", plaintext);
                })
                .await?;
            println!("Listening for messages (ctrl-c to quit)");

            tokio::signal::ctrl_c().await?;
            engine.stop().await?;
        }

        Commands::Send {
            descriptor,
            message,
        } => {
            let peer = parse_descriptor(descriptor)?;
            let engine = started_engine(&cli, false).await?;
            engine.send_message(message, &peer).await?;
            println!("Sent");
            engine.stop().await?;
        }
    }

    Ok(())
}
