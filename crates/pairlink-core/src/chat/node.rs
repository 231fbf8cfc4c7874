//! The black-box relay node interface
//!
//! Everything the core needs from the chat substrate, expressed as typed
//! operations so the HTTP wire protocol stays out of the core logic and
//! tests can substitute an in-memory federation.

use async_trait::async_trait;

use crate::error::P2pResult;
use crate::types::RoomMessage;

/// Password-login request.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub user: String,
    pub password: String,
    pub device_id: String,
}

/// An authenticated session on a relay node.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub user_id: String,
    pub access_token: String,
    pub device_id: String,
}

/// Per-room delta from one sync round.
#[derive(Debug, Clone, Default)]
pub struct RoomDelta {
    pub room_id: String,
    /// Addresses known to be members after this round
    pub members: Vec<String>,
    /// Messages that arrived this round, in server order
    pub messages: Vec<RoomMessage>,
}

/// One round of incremental synchronization.
#[derive(Debug, Clone, Default)]
pub struct SyncDelta {
    /// Cursor to resume from on the next round
    pub next_batch: String,
    pub joined: Vec<RoomDelta>,
    /// Rooms we were invited to
    pub invited: Vec<String>,
    /// Rooms we left or were removed from
    pub left: Vec<String>,
}

/// Operations a relay node exposes.
///
/// Implementations map errors onto the crate taxonomy; in particular a
/// rejected join/send must surface as [`crate::P2pError::Forbidden`] so the
/// callers' recovery paths trigger.
#[async_trait]
pub trait ChatNode: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> P2pResult<LoginSession>;

    /// Long-poll for the next batch of events. `since` is the last cursor,
    /// `timeout_ms` the server-side hold time.
    async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout_ms: u64,
    ) -> P2pResult<SyncDelta>;

    /// Send a text message; `txn_id` deduplicates retries. Returns the
    /// server-assigned event id.
    async fn send_text(
        &self,
        access_token: &str,
        room_id: &str,
        body: &str,
        txn_id: &str,
    ) -> P2pResult<String>;

    /// Create a trusted private room with the given invitees. Returns the
    /// new room id.
    async fn create_room(&self, access_token: &str, invitees: &[String]) -> P2pResult<String>;

    async fn invite(&self, access_token: &str, room_id: &str, user_id: &str) -> P2pResult<()>;

    async fn join(&self, access_token: &str, room_id: &str) -> P2pResult<()>;
}
