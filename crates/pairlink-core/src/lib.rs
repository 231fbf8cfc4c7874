//! pairlink core library
//!
//! End-to-end encrypted peer-to-peer communication tunneled through a
//! federation of chat relay servers. Two mutually-untrusted peers — e.g. a
//! wallet and a dApp — pair by exchanging descriptors out-of-band, then
//! exchange sealed-box handshakes and secretbox session traffic through
//! chat rooms on a deterministically selected relay.
//!
//! ## Overview
//!
//! - Relay selection is a pure distance computation over the identity hash,
//!   so both peers converge on the same server without coordination.
//! - Login is derived from the long-term Ed25519 key: the password is a
//!   signature over a 5-minute time bucket.
//! - The handshake uses an anonymous sealed box; session traffic uses
//!   authenticated symmetric encryption under X25519-derived keys.
//! - Client state (sync cursor, room catalog) survives restarts through a
//!   pluggable key-value storage backend.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pairlink_core::{Config, Identity, PairingEngine, RedbStorage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = Identity::generate()?;
//!     let storage = Arc::new(RedbStorage::new("~/.pairlink/pairlink.redb")?);
//!
//!     let engine = PairingEngine::with_http_nodes(
//!         Config::new("My dApp"),
//!         identity,
//!         storage,
//!     );
//!     engine.start().await?;
//!
//!     // Ship this out-of-band, e.g. as a QR code:
//!     let request = engine.get_pairing_request_info()?;
//!     println!("{}", serde_json::to_string(&request)?);
//!
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod pairing;
pub mod relay;
pub mod routing;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use chat::{ChatClient, ChatEvent, ChatNode, HttpChatNode};
pub use engine::{http_node_factory, Config, NodeFactory, PairingEngine};
pub use error::{P2pError, P2pResult};
pub use identity::{Identity, LoginCredentials};
pub use pairing::{ExtendedPairingResponse, PairingInfo, PairingKind};
pub use relay::{select_relay, DEFAULT_RELAY_NODES};
pub use storage::{MemoryStorage, RedbStorage, Storage, StorageKey};
pub use store::{ClientState, StateKey, StateStore, StateUpdate};
pub use types::{MessageKind, Room, RoomMessage, RoomStatus};
