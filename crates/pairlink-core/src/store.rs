//! Client-side state store
//!
//! Holds the chat session state (tokens, polling bookkeeping, room catalog)
//! in memory, hydrates once from persistent storage, and serializes every
//! mutation through [`StateStore::update`]. Only `{syncToken, rooms}`
//! survive a restart; room message lists never do.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::P2pResult;
use crate::storage::{Storage, StorageKey};
use crate::types::{Room, RoomStatus};

/// Keys of [`ClientState`], used to scope change listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    IsRunning,
    UserId,
    DeviceId,
    TxnNo,
    AccessToken,
    SyncToken,
    PollingTimeout,
    PollingRetries,
    Rooms,
}

/// The full client state.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    pub is_running: bool,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    /// Monotonic transaction counter for outgoing sends
    pub txn_no: u64,
    pub access_token: Option<String>,
    /// Opaque cursor into the relay's event stream
    pub sync_token: Option<String>,
    /// Long-poll timeout handed to the relay, milliseconds
    pub polling_timeout: Option<u64>,
    /// Consecutive failed sync rounds
    pub polling_retries: u32,
    pub rooms: HashMap<String, Room>,
}

impl ClientState {
    pub fn rooms_with_status(&self, status: RoomStatus) -> Vec<Room> {
        self.rooms
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }
}

/// Rooms in an update can arrive as a list (from sync deltas) or a map.
#[derive(Debug, Clone)]
pub enum RoomsUpdate {
    List(Vec<Room>),
    Map(HashMap<String, Room>),
}

impl RoomsUpdate {
    fn into_map(self) -> HashMap<String, Room> {
        match self {
            RoomsUpdate::Map(map) => map,
            RoomsUpdate::List(rooms) => {
                rooms.into_iter().map(|r| (r.id.clone(), r)).collect()
            }
        }
    }
}

impl From<Vec<Room>> for RoomsUpdate {
    fn from(rooms: Vec<Room>) -> Self {
        RoomsUpdate::List(rooms)
    }
}

impl From<HashMap<String, Room>> for RoomsUpdate {
    fn from(rooms: HashMap<String, Room>) -> Self {
        RoomsUpdate::Map(rooms)
    }
}

/// A partial state mutation. Absent fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub is_running: Option<bool>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub txn_no: Option<u64>,
    pub access_token: Option<String>,
    pub sync_token: Option<String>,
    pub polling_timeout: Option<u64>,
    pub polling_retries: Option<u32>,
    pub rooms: Option<RoomsUpdate>,
}

impl StateUpdate {
    fn changed_keys(&self) -> Vec<StateKey> {
        let mut keys = Vec::new();
        if self.is_running.is_some() {
            keys.push(StateKey::IsRunning);
        }
        if self.user_id.is_some() {
            keys.push(StateKey::UserId);
        }
        if self.device_id.is_some() {
            keys.push(StateKey::DeviceId);
        }
        if self.txn_no.is_some() {
            keys.push(StateKey::TxnNo);
        }
        if self.access_token.is_some() {
            keys.push(StateKey::AccessToken);
        }
        if self.sync_token.is_some() {
            keys.push(StateKey::SyncToken);
        }
        if self.polling_timeout.is_some() {
            keys.push(StateKey::PollingTimeout);
        }
        if self.polling_retries.is_some() {
            keys.push(StateKey::PollingRetries);
        }
        if self.rooms.is_some() {
            keys.push(StateKey::Rooms);
        }
        keys
    }
}

/// The shape persisted to storage. Everything else is session-local.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreservedState {
    #[serde(default)]
    sync_token: Option<String>,
    #[serde(default)]
    rooms: HashMap<String, Room>,
}

type Listener = Box<dyn Fn(&ClientState, &ClientState, &StateUpdate) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    keyed: HashMap<StateKey, Vec<Listener>>,
    all: Vec<Listener>,
}

/// Serialized, lazily-hydrated state store.
///
/// The single async mutex doubles as the hydration barrier and the update
/// serializer: every caller that touches state first awaits hydration, so
/// no update is ever lost to a startup race, and listeners observe each
/// transition exactly once.
pub struct StateStore {
    storage: Arc<dyn Storage>,
    state: Mutex<Option<ClientState>>,
    listeners: parking_lot::RwLock<ListenerRegistry>,
}

impl StateStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            state: Mutex::new(None),
            listeners: parking_lot::RwLock::new(ListenerRegistry::default()),
        }
    }

    fn hydrate(&self, slot: &mut Option<ClientState>) -> P2pResult<()> {
        if slot.is_some() {
            return Ok(());
        }

        let mut state = ClientState::default();
        if let Some(raw) = self.storage.get(StorageKey::PreservedState)? {
            match serde_json::from_str::<PreservedState>(&raw) {
                Ok(preserved) => {
                    state.sync_token = preserved.sync_token;
                    state.rooms = preserved.rooms;
                }
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable preserved state");
                }
            }
        }
        *slot = Some(state);
        Ok(())
    }

    /// A consistent snapshot of the current state.
    pub async fn snapshot(&self) -> P2pResult<ClientState> {
        let mut guard = self.state.lock().await;
        self.hydrate(&mut guard)?;
        Ok(guard.as_ref().expect("hydrated").clone())
    }

    pub async fn get_room(&self, room_id: &str) -> P2pResult<Option<Room>> {
        Ok(self.snapshot().await?.rooms.get(room_id).cloned())
    }

    pub async fn rooms_with_status(&self, status: RoomStatus) -> P2pResult<Vec<Room>> {
        Ok(self.snapshot().await?.rooms_with_status(status))
    }

    /// Register a listener for specific state keys.
    pub fn on_state_changed<F>(&self, keys: &[StateKey], listener: F)
    where
        F: Fn(&ClientState, &ClientState, &StateUpdate) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let mut registry = self.listeners.write();
        for key in keys {
            let listener = listener.clone();
            registry
                .keyed
                .entry(*key)
                .or_default()
                .push(Box::new(move |old, new, delta| (*listener)(old, new, delta)));
        }
    }

    /// Register a listener invoked on every update.
    pub fn on_any_change<F>(&self, listener: F)
    where
        F: Fn(&ClientState, &ClientState, &StateUpdate) + Send + Sync + 'static,
    {
        self.listeners.write().all.push(Box::new(listener));
    }

    /// Apply a partial update: merge, persist the preserved fields, notify.
    pub async fn update(&self, update: StateUpdate) -> P2pResult<()> {
        let mut guard = self.state.lock().await;
        self.hydrate(&mut guard)?;
        let state = guard.as_mut().expect("hydrated");
        let old = state.clone();

        if let Some(v) = update.is_running {
            state.is_running = v;
        }
        if let Some(ref v) = update.user_id {
            state.user_id = Some(v.clone());
        }
        if let Some(ref v) = update.device_id {
            state.device_id = Some(v.clone());
        }
        if let Some(v) = update.txn_no {
            state.txn_no = v;
        }
        if let Some(ref v) = update.access_token {
            state.access_token = Some(v.clone());
        }
        if let Some(ref v) = update.sync_token {
            state.sync_token = Some(v.clone());
        }
        if let Some(v) = update.polling_timeout {
            state.polling_timeout = Some(v);
        }
        if let Some(v) = update.polling_retries {
            state.polling_retries = v;
        }
        if let Some(ref rooms) = update.rooms {
            for (id, incoming) in rooms.clone().into_map() {
                match state.rooms.get_mut(&id) {
                    Some(existing) => existing.merge(incoming),
                    None => {
                        state.rooms.insert(id, incoming);
                    }
                }
            }
        }

        // Persist only when syncToken or rooms were part of this update and
        // non-empty; the serialized copy always drops transient messages.
        let sync_token_updated = update
            .sync_token
            .as_ref()
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if sync_token_updated || update.rooms.is_some() {
            let mut rooms = state.rooms.clone();
            for room in rooms.values_mut() {
                room.messages.clear();
            }
            let preserved = PreservedState {
                sync_token: state.sync_token.clone(),
                rooms,
            };
            self.storage
                .set(StorageKey::PreservedState, &serde_json::to_string(&preserved)?)?;
        }

        let new = state.clone();
        let registry = self.listeners.read();
        for key in update.changed_keys() {
            if let Some(listeners) = registry.keyed.get(&key) {
                for listener in listeners {
                    listener(&old, &new, &update);
                }
            }
        }
        for listener in &registry.all {
            listener(&old, &new, &update);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{MessageKind, RoomMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> (Arc<MemoryStorage>, StateStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = StateStore::new(storage.clone());
        (storage, store)
    }

    #[tokio::test]
    async fn test_only_sync_token_and_rooms_survive() {
        let (storage, store) = store();
        store
            .update(StateUpdate {
                access_token: Some("secret".into()),
                user_id: Some("user".into()),
                sync_token: Some("s1".into()),
                rooms: Some(vec![Room::new("!a:relay", RoomStatus::Joined)].into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let reloaded = StateStore::new(storage);
        let state = reloaded.snapshot().await.unwrap();
        assert_eq!(state.sync_token.as_deref(), Some("s1"));
        assert!(state.rooms.contains_key("!a:relay"));
        assert_eq!(state.access_token, None);
        assert_eq!(state.user_id, None);
        assert!(!state.is_running);
    }

    #[tokio::test]
    async fn test_messages_are_not_persisted() {
        let (storage, store) = store();
        let mut room = Room::new("!a:relay", RoomStatus::Joined);
        room.messages.push(RoomMessage {
            kind: MessageKind::Text,
            content: "hello".into(),
            sender: "@x:relay".into(),
            timestamp: 1,
        });
        store
            .update(StateUpdate {
                rooms: Some(vec![room].into()),
                ..Default::default()
            })
            .await
            .unwrap();

        // In-memory copy keeps the message for this session
        assert_eq!(
            store.get_room("!a:relay").await.unwrap().unwrap().messages.len(),
            1
        );

        // Rehydrated copy does not
        let reloaded = StateStore::new(storage);
        let room = reloaded.get_room("!a:relay").await.unwrap().unwrap();
        assert!(room.messages.is_empty());
    }

    #[tokio::test]
    async fn test_no_persist_without_sync_token_or_rooms() {
        let (storage, store) = store();
        store
            .update(StateUpdate {
                access_token: Some("secret".into()),
                polling_retries: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(storage.get(StorageKey::PreservedState).unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_sync_token_does_not_persist() {
        let (storage, store) = store();
        store
            .update(StateUpdate {
                sync_token: Some(String::new()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(storage.get(StorageKey::PreservedState).unwrap(), None);
    }

    #[tokio::test]
    async fn test_merge_upgrades_status_and_unions_members() {
        let (_, store) = store();
        store
            .update(StateUpdate {
                rooms: Some(
                    vec![Room::new("!a:relay", RoomStatus::Invited)
                        .with_members(vec!["@x:relay".into()])]
                    .into(),
                ),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .update(StateUpdate {
                rooms: Some(
                    vec![Room::new("!a:relay", RoomStatus::Joined)
                        .with_members(vec!["@y:relay".into()])]
                    .into(),
                ),
                ..Default::default()
            })
            .await
            .unwrap();

        let room = store.get_room("!a:relay").await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Joined);
        assert_eq!(room.members, vec!["@x:relay", "@y:relay"]);
    }

    #[tokio::test]
    async fn test_rooms_absent_from_update_are_retained() {
        let (_, store) = store();
        store
            .update(StateUpdate {
                rooms: Some(vec![Room::new("!a:relay", RoomStatus::Joined)].into()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .update(StateUpdate {
                rooms: Some(vec![Room::new("!b:relay", RoomStatus::Invited)].into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = store.snapshot().await.unwrap();
        assert_eq!(state.rooms.len(), 2);
    }

    #[tokio::test]
    async fn test_listeners_fire_per_key_and_for_all() {
        let (_, store) = store();
        let keyed_calls = Arc::new(AtomicUsize::new(0));
        let all_calls = Arc::new(AtomicUsize::new(0));

        let counter = keyed_calls.clone();
        store.on_state_changed(&[StateKey::SyncToken], move |old, new, _| {
            assert_ne!(old.sync_token, new.sync_token);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = all_calls.clone();
        store.on_any_change(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store
            .update(StateUpdate {
                sync_token: Some("s1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .update(StateUpdate {
                polling_retries: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(keyed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(all_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_update_awaits_hydration() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(
                StorageKey::PreservedState,
                r#"{"syncToken":"old","rooms":{"!a:relay":{"id":"!a:relay","status":"joined"}}}"#,
            )
            .unwrap();

        let store = StateStore::new(storage);
        // First operation is an update: hydration must happen underneath it.
        store
            .update(StateUpdate {
                sync_token: Some("new".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = store.snapshot().await.unwrap();
        assert_eq!(state.sync_token.as_deref(), Some("new"));
        assert!(state.rooms.contains_key("!a:relay"));
    }

    #[tokio::test]
    async fn test_map_and_list_updates_equivalent() {
        let (_, store) = store();
        let mut map = HashMap::new();
        map.insert(
            "!m:relay".to_string(),
            Room::new("!m:relay", RoomStatus::Joined),
        );
        store
            .update(StateUpdate {
                rooms: Some(map.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.get_room("!m:relay").await.unwrap().is_some());
    }
}
