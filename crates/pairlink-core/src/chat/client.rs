//! Sync-loop client for one relay node
//!
//! Owns the long-running synchronization session: password-login, the
//! background long-poll loop, room operations, and the event broadcast.
//!
//! The sync token only advances on successful rounds, so subscribers get
//! at-least-once delivery; failed rounds bump `pollingRetries` and back off
//! exponentially up to a ceiling.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::ChatEvent;
use super::node::{ChatNode, LoginRequest, SyncDelta};
use crate::error::{P2pError, P2pResult};
use crate::identity::LoginCredentials;
use crate::store::{StateStore, StateUpdate};
use crate::types::{Room, RoomStatus};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default server-side long-poll hold time, milliseconds
const DEFAULT_POLL_TIMEOUT_MS: u64 = 30_000;

/// Backoff for failed sync rounds: base * 2^(retries-1), capped
const SYNC_BACKOFF_BASE_MS: u64 = 1_000;
const SYNC_BACKOFF_CEILING_MS: u64 = 30_000;

pub struct ChatClient {
    node: Arc<dyn ChatNode>,
    store: Arc<StateStore>,
    event_tx: broadcast::Sender<ChatEvent>,
    shutdown_tx: watch::Sender<bool>,
    sync_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(node: Arc<dyn ChatNode>, store: Arc<StateStore>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node,
            store,
            event_tx,
            shutdown_tx,
            sync_task: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribe to the event stream. Subscribers registered before a sync
    /// round observe every event of that round.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Authenticate against the node and start the background sync loop.
    pub async fn start(&self, credentials: &LoginCredentials) -> P2pResult<()> {
        let session = self
            .node
            .login(&LoginRequest {
                user: credentials.user_id.clone(),
                password: credentials.password.clone(),
                device_id: credentials.device_id.clone(),
            })
            .await?;
        info!(user_id = %session.user_id, "Logged in to relay node");

        self.store
            .update(StateUpdate {
                is_running: Some(true),
                user_id: Some(session.user_id),
                device_id: Some(session.device_id),
                access_token: Some(session.access_token),
                polling_timeout: Some(DEFAULT_POLL_TIMEOUT_MS),
                polling_retries: Some(0),
                ..Default::default()
            })
            .await?;

        let node = self.node.clone();
        let store = self.store.clone();
        let event_tx = self.event_tx.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_sync_loop(node, store, event_tx, shutdown_rx));
        *self.sync_task.lock() = Some(handle);

        Ok(())
    }

    /// Terminate the sync loop. Outstanding sends complete independently.
    pub async fn stop(&self) -> P2pResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sync_task.lock().take() {
            handle.abort();
        }
        self.store
            .update(StateUpdate {
                is_running: Some(false),
                ..Default::default()
            })
            .await
    }

    async fn access_token(&self) -> P2pResult<String> {
        self.store
            .snapshot()
            .await?
            .access_token
            .ok_or(P2pError::NotReady)
    }

    /// Join rooms by id. A "forbidden" rejection is surfaced to the caller,
    /// who decides whether to retry.
    pub async fn join_rooms(&self, room_ids: &[String]) -> P2pResult<()> {
        let token = self.access_token().await?;
        for room_id in room_ids {
            self.node.join(&token, room_id).await?;
            self.store
                .update(StateUpdate {
                    rooms: Some(vec![Room::new(room_id.clone(), RoomStatus::Joined)].into()),
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }

    /// Create a trusted private room and invite the given users.
    pub async fn create_trusted_private_room(&self, invitees: &[String]) -> P2pResult<String> {
        let token = self.access_token().await?;
        let room_id = self.node.create_room(&token, invitees).await?;
        debug!(room_id = %room_id, invitees = invitees.len(), "Created trusted private room");

        // Invitees become members only once their joins show up in sync.
        let state = self.store.snapshot().await?;
        let members = state.user_id.into_iter().collect();
        self.store
            .update(StateUpdate {
                rooms: Some(
                    vec![Room::new(room_id.clone(), RoomStatus::Joined).with_members(members)]
                        .into(),
                ),
                ..Default::default()
            })
            .await?;
        Ok(room_id)
    }

    pub async fn invite_to_rooms(&self, user_id: &str, room_ids: &[String]) -> P2pResult<()> {
        let token = self.access_token().await?;
        for room_id in room_ids {
            self.node.invite(&token, room_id, user_id).await?;
        }
        Ok(())
    }

    /// Send a text message into a room, consuming one transaction number.
    pub async fn send_text_message(&self, room_id: &str, text: &str) -> P2pResult<String> {
        let token = self.access_token().await?;
        let txn_no = self.store.snapshot().await?.txn_no;
        self.store
            .update(StateUpdate {
                txn_no: Some(txn_no + 1),
                ..Default::default()
            })
            .await?;

        self.node
            .send_text(&token, room_id, text, &format!("m{}", txn_no))
            .await
    }

    pub async fn get_room_by_id(&self, room_id: &str) -> P2pResult<Option<Room>> {
        self.store.get_room(room_id).await
    }

    pub async fn joined_rooms(&self) -> P2pResult<Vec<Room>> {
        self.store.rooms_with_status(RoomStatus::Joined).await
    }

    pub async fn invited_rooms(&self) -> P2pResult<Vec<Room>> {
        self.store.rooms_with_status(RoomStatus::Invited).await
    }
}

fn backoff_ms(retries: u32) -> u64 {
    let exp = retries.saturating_sub(1).min(16);
    (SYNC_BACKOFF_BASE_MS << exp).min(SYNC_BACKOFF_CEILING_MS)
}

async fn run_sync_loop(
    node: Arc<dyn ChatNode>,
    store: Arc<StateStore>,
    event_tx: broadcast::Sender<ChatEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            debug!("Sync loop stopped");
            return;
        }

        let state = match store.snapshot().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Sync loop cannot read state");
                return;
            }
        };
        let Some(access_token) = state.access_token else {
            warn!("Sync loop started without access token");
            return;
        };
        let timeout = state.polling_timeout.unwrap_or(DEFAULT_POLL_TIMEOUT_MS);

        match node
            .sync(&access_token, state.sync_token.as_deref(), timeout)
            .await
        {
            Ok(delta) => {
                if let Err(e) = apply_sync_delta(&store, &event_tx, delta).await {
                    warn!(error = %e, "Failed to apply sync delta");
                }
            }
            Err(e) => {
                let retries = state.polling_retries + 1;
                warn!(error = %e, retries, "Sync round failed");
                let _ = store
                    .update(StateUpdate {
                        polling_retries: Some(retries),
                        ..Default::default()
                    })
                    .await;

                let delay = std::time::Duration::from_millis(backoff_ms(retries));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
}

/// Merge one round into the store, then publish its events. The token only
/// moves here, after a successful round.
async fn apply_sync_delta(
    store: &Arc<StateStore>,
    event_tx: &broadcast::Sender<ChatEvent>,
    delta: SyncDelta,
) -> P2pResult<()> {
    let mut rooms: Vec<Room> = Vec::new();
    for joined in &delta.joined {
        let mut room = Room::new(joined.room_id.clone(), RoomStatus::Joined)
            .with_members(joined.members.clone());
        room.messages = joined.messages.clone();
        rooms.push(room);
    }
    for room_id in &delta.invited {
        rooms.push(Room::new(room_id.clone(), RoomStatus::Invited));
    }
    for room_id in &delta.left {
        rooms.push(Room::new(room_id.clone(), RoomStatus::Left));
    }

    store
        .update(StateUpdate {
            sync_token: Some(delta.next_batch),
            polling_retries: Some(0),
            rooms: Some(rooms.into()),
            ..Default::default()
        })
        .await?;

    for room_id in delta.invited {
        let _ = event_tx.send(ChatEvent::Invite { room_id });
    }
    for joined in delta.joined {
        for message in joined.messages {
            let _ = event_tx.send(ChatEvent::Message {
                room_id: joined.room_id.clone(),
                message,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded_exponential() {
        assert_eq!(backoff_ms(1), 1_000);
        assert_eq!(backoff_ms(2), 2_000);
        assert_eq!(backoff_ms(3), 4_000);
        assert_eq!(backoff_ms(6), 30_000);
        assert_eq!(backoff_ms(60), 30_000);
    }
}
