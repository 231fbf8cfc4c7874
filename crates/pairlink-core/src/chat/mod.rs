//! Chat substrate client
//!
//! The wire protocol is a black box behind the [`ChatNode`] trait: it
//! exposes login, a long-poll sync stream of room/membership/message
//! deltas, and a handful of room operations. [`ChatClient`] owns the sync
//! loop against one relay node and publishes typed [`ChatEvent`]s.

mod client;
mod events;
mod http;
mod node;

pub use client::ChatClient;
pub use events::ChatEvent;
pub use http::HttpChatNode;
pub use node::{ChatNode, LoginRequest, LoginSession, RoomDelta, SyncDelta};
