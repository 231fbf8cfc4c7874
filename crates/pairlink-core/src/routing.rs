//! Recipient-to-room routing
//!
//! Maps a recipient address to the room used for traffic with that peer.
//! Resolution order: persisted cache, joined-room member scan, standby-room
//! consumption, fresh trusted private room. Bindings live in storage under
//! `peer-room-ids`; wallet-role peers keep one pre-provisioned `standby-room`
//! so first contact skips room-creation latency.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chat::ChatClient;
use crate::error::P2pResult;
use crate::storage::{Storage, StorageKey};

pub struct RoomRouter {
    storage: Arc<dyn Storage>,
}

impl RoomRouter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn peer_rooms(&self) -> P2pResult<HashMap<String, String>> {
        match self.storage.get(StorageKey::PeerRoomIds)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(HashMap::new()),
        }
    }

    fn save_peer_rooms(&self, rooms: &HashMap<String, String>) -> P2pResult<()> {
        self.storage
            .set(StorageKey::PeerRoomIds, &serde_json::to_string(rooms)?)
    }

    /// The cached binding for a recipient, if any.
    pub fn cached_room(&self, recipient: &str) -> P2pResult<Option<String>> {
        Ok(self.peer_rooms()?.get(recipient).cloned())
    }

    /// Persist `recipient -> room_id`.
    pub fn bind(&self, recipient: &str, room_id: &str) -> P2pResult<()> {
        let mut rooms = self.peer_rooms()?;
        rooms.insert(recipient.to_string(), room_id.to_string());
        self.save_peer_rooms(&rooms)
    }

    /// Drop every binding that points at `room_id`. Triggered when a send
    /// into that room came back forbidden.
    pub fn evict_room(&self, room_id: &str) -> P2pResult<()> {
        let mut rooms = self.peer_rooms()?;
        let before = rooms.len();
        rooms.retain(|_, bound| bound != room_id);
        if rooms.len() != before {
            info!(room_id = %room_id, "Evicted invalidated room binding");
        }
        self.save_peer_rooms(&rooms)
    }

    /// Resolve the room to use for `recipient`, creating one if necessary.
    ///
    /// When `replenish_standby` is set (wallet role), consuming the standby
    /// room schedules creation of its replacement in the background.
    pub async fn relevant_room(
        &self,
        client: &Arc<ChatClient>,
        recipient: &str,
        replenish_standby: bool,
    ) -> P2pResult<String> {
        if let Some(room_id) = self.cached_room(recipient)? {
            return Ok(room_id);
        }

        // A joined room already containing the recipient is relevant.
        for room in client.joined_rooms().await? {
            if room.has_member(recipient) {
                debug!(room_id = %room.id, recipient = %recipient, "Reusing joined room");
                self.bind(recipient, &room.id)?;
                return Ok(room.id);
            }
        }

        if let Some(standby) = self.storage.get(StorageKey::StandbyRoom)? {
            self.storage.delete(StorageKey::StandbyRoom)?;
            info!(room_id = %standby, recipient = %recipient, "Consuming standby room");

            if replenish_standby {
                let client = client.clone();
                let storage = self.storage.clone();
                tokio::spawn(async move {
                    match client.create_trusted_private_room(&[]).await {
                        Ok(room_id) => {
                            if let Err(e) = storage.set(StorageKey::StandbyRoom, &room_id) {
                                warn!(error = %e, "Failed to persist replacement standby room");
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to create replacement standby room"),
                    }
                });
            }

            client
                .invite_to_rooms(recipient, &[standby.clone()])
                .await?;
            self.bind(recipient, &standby)?;
            return Ok(standby);
        }

        let room_id = client
            .create_trusted_private_room(&[recipient.to_string()])
            .await?;
        self.bind(recipient, &room_id)?;
        Ok(room_id)
    }

    /// Make sure a standby room exists for future handshakes.
    pub async fn ensure_standby_room(&self, client: &Arc<ChatClient>) -> P2pResult<()> {
        if self.storage.get(StorageKey::StandbyRoom)?.is_some() {
            return Ok(());
        }
        let room_id = client.create_trusted_private_room(&[]).await?;
        self.storage.set(StorageKey::StandbyRoom, &room_id)?;
        info!(room_id = %room_id, "Provisioned standby room");
        Ok(())
    }
}
