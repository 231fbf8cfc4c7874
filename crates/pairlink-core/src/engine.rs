//! The pairing and messaging engine
//!
//! `PairingEngine` is the entry point: it logs in to the relay closest to
//! the local identity, tunnels the pairing handshake through sealed boxes
//! tagged `@channel-open`, derives per-peer session keys, and routes
//! encrypted session traffic to the right room — recovering when the
//! substrate invalidates one.
//!
//! The engine owns the chat client; spawned listener tasks capture only the
//! client and shared state, never the engine, so there is no reference
//! cycle between the two.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::{ChatClient, ChatEvent, ChatNode, HttpChatNode};
use crate::crypto::{self, SymmetricKey};
use crate::error::{P2pError, P2pResult};
use crate::identity::{sender_id, x25519_public_from_ed25519, Identity};
use crate::pairing::{
    channel_open_payload, channel_open_text, is_channel_open_for, parse_pairing_response,
    ExtendedPairingResponse, PairingInfo, PairingKind,
};
use crate::relay::select_relay;
use crate::routing::RoomRouter;
use crate::storage::Storage;
use crate::store::StateStore;
use crate::types::MessageKind;

/// Delay between join retries after a "forbidden" rejection. A freshly
/// invited user can be momentarily rejected by a federated server.
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(200);
const JOIN_MAX_ATTEMPTS: u32 = 10;

/// Member-wait schedule: fast polling for the first ~5 s, then slow.
const MEMBER_WAIT_FAST: Duration = Duration::from_millis(100);
const MEMBER_WAIT_SLOW: Duration = Duration::from_secs(1);
const MEMBER_WAIT_FAST_ATTEMPTS: u32 = 50;
const MEMBER_WAIT_MAX_ATTEMPTS: u32 = 200;

/// How long a captured early message stays eligible for replay.
const CAPTURE_REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// Engine configuration.
#[derive(Clone)]
pub struct Config {
    /// Display name carried in pairing payloads
    pub name: String,
    /// Protocol version carried in pairing payloads
    pub version: String,
    /// Relay node list; empty falls back to the built-in defaults
    pub relay_nodes: Vec<String>,
    /// Advisory only: the engine always targets one active relay
    pub replication_count: u32,
    pub icon_url: Option<String>,
    pub app_url: Option<String>,
    /// Wallet role: accepts handshakes and maintains a standby room
    pub wallet: bool,
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            relay_nodes: Vec::new(),
            replication_count: 1,
            icon_url: None,
            app_url: None,
            wallet: false,
        }
    }
}

/// Builds a node client for the selected relay host.
pub type NodeFactory = Box<dyn Fn(&str) -> P2pResult<Arc<dyn ChatNode>> + Send + Sync>;

/// The default factory: HTTPS to the relay host.
pub fn http_node_factory() -> NodeFactory {
    Box::new(|relay| {
        Ok(Arc::new(HttpChatNode::connect(&format!("https://{}", relay))?) as Arc<dyn ChatNode>)
    })
}

/// A text message remembered by the startup capture listener so an early
/// channel payload survives until a caller registers its listener.
#[derive(Clone)]
struct CapturedMessage {
    content: String,
    sender: String,
    timestamp: i64,
    received_at: Instant,
}

pub struct PairingEngine {
    config: Config,
    identity: Identity,
    storage: Arc<dyn Storage>,
    node_factory: NodeFactory,
    router: RoomRouter,
    client: tokio::sync::RwLock<Option<Arc<ChatClient>>>,
    active_relay: parking_lot::Mutex<Option<String>>,
    /// Per-peer send keys (we act as KX client towards the peer)
    tx_keys: parking_lot::Mutex<HashMap<String, SymmetricKey>>,
    /// Per-peer receive keys (we act as KX server towards the peer)
    rx_keys: parking_lot::Mutex<HashMap<String, SymmetricKey>>,
    captured: Arc<parking_lot::Mutex<Option<CapturedMessage>>>,
    capture_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    listener_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    message_listeners: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PairingEngine {
    pub fn new(
        config: Config,
        identity: Identity,
        storage: Arc<dyn Storage>,
        node_factory: NodeFactory,
    ) -> Self {
        Self {
            config,
            identity,
            storage: storage.clone(),
            node_factory,
            router: RoomRouter::new(storage),
            client: tokio::sync::RwLock::new(None),
            active_relay: parking_lot::Mutex::new(None),
            tx_keys: parking_lot::Mutex::new(HashMap::new()),
            rx_keys: parking_lot::Mutex::new(HashMap::new()),
            captured: Arc::new(parking_lot::Mutex::new(None)),
            capture_task: parking_lot::Mutex::new(None),
            listener_tasks: parking_lot::Mutex::new(Vec::new()),
            message_listeners: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Engine with the HTTPS node transport.
    pub fn with_http_nodes(config: Config, identity: Identity, storage: Arc<dyn Storage>) -> Self {
        Self::new(config, identity, storage, http_node_factory())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The relay this engine is connected to, once started.
    pub fn active_relay(&self) -> Option<String> {
        self.active_relay.lock().clone()
    }

    async fn client(&self) -> P2pResult<Arc<ChatClient>> {
        self.client.read().await.clone().ok_or(P2pError::NotReady)
    }

    /// Log in to the closest relay and begin syncing.
    pub async fn start(&self) -> P2pResult<()> {
        let credentials = self.identity.login_credentials(Utc::now().timestamp());
        let relay = select_relay(
            &self.identity.public_key_hash_hex(),
            "0",
            &self.config.relay_nodes,
        )?
        .to_string();
        info!(
            relay = %relay,
            wallet = self.config.wallet,
            replication_count = self.config.replication_count,
            "Starting pairing engine"
        );

        let node = (self.node_factory)(&relay)?;
        let store = Arc::new(StateStore::new(self.storage.clone()));
        let client = Arc::new(ChatClient::new(node, store));

        // Listeners go in before the sync loop starts so nothing is missed.
        self.spawn_capture_listener(&client);
        self.spawn_invite_listener(&client);

        client.start(&credentials).await?;

        // Rooms we were invited to while offline.
        let invited: Vec<String> = client
            .invited_rooms()
            .await?
            .into_iter()
            .map(|room| room.id)
            .collect();
        for room_id in invited {
            try_join_rooms(&client, &room_id).await;
        }

        if self.config.wallet {
            self.router.ensure_standby_room(&client).await?;
        }

        *self.active_relay.lock() = Some(relay);
        *self.client.write().await = Some(client);
        Ok(())
    }

    /// Stop the sync loop and tear down all listener tasks.
    pub async fn stop(&self) -> P2pResult<()> {
        if let Some(client) = self.client.write().await.take() {
            client.stop().await?;
        }
        if let Some(handle) = self.capture_task.lock().take() {
            handle.abort();
        }
        for handle in self.listener_tasks.lock().drain(..) {
            handle.abort();
        }
        for (_, handle) in self.message_listeners.lock().drain() {
            handle.abort();
        }
        *self.captured.lock() = None;
        Ok(())
    }

    /// Remembers the most recent text message (by timestamp) so a channel
    /// payload arriving before `listen_for_encrypted_messages` is not lost.
    fn spawn_capture_listener(&self, client: &Arc<ChatClient>) {
        let mut events = client.subscribe();
        let captured = self.captured.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChatEvent::Message { message, .. }) => {
                        if message.kind != MessageKind::Text {
                            continue;
                        }
                        let mut slot = captured.lock();
                        let newer = slot
                            .as_ref()
                            .map(|held| message.timestamp >= held.timestamp)
                            .unwrap_or(true);
                        if newer {
                            *slot = Some(CapturedMessage {
                                content: message.content,
                                sender: message.sender,
                                timestamp: message.timestamp,
                                received_at: Instant::now(),
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Capture listener lagged behind event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        *self.capture_task.lock() = Some(handle);
    }

    /// Auto-joins rooms we get invited to.
    fn spawn_invite_listener(&self, client: &Arc<ChatClient>) {
        let mut events = client.subscribe();
        let client = client.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChatEvent::Invite { room_id }) => {
                        let client = client.clone();
                        tokio::spawn(async move {
                            try_join_rooms(&client, &room_id).await;
                        });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Invite listener lagged behind event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        self.listener_tasks.lock().push(handle);
    }

    /// The descriptor a counterparty needs to pair with us, shipped
    /// out-of-band (QR code, link). Fresh id per call.
    pub fn get_pairing_request_info(&self) -> P2pResult<PairingInfo> {
        let relay = select_relay(
            &self.identity.public_key_hash_hex(),
            "0",
            &self.config.relay_nodes,
        )?
        .to_string();
        Ok(PairingInfo {
            id: Uuid::new_v4().to_string(),
            kind: PairingKind::Request,
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            public_key: self.identity.public_key_hex(),
            relay_server: relay,
            icon: self.config.icon_url.clone(),
            app_url: self.config.app_url.clone(),
        })
    }

    fn pairing_response_info(&self, request: &PairingInfo) -> P2pResult<PairingInfo> {
        let relay = self
            .active_relay
            .lock()
            .clone()
            .ok_or(P2pError::NotReady)?;
        Ok(PairingInfo {
            id: request.id.clone(),
            kind: PairingKind::Response,
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            public_key: self.identity.public_key_hex(),
            relay_server: relay,
            icon: self.config.icon_url.clone(),
            app_url: self.config.app_url.clone(),
        })
    }

    /// Watch for `@channel-open` messages addressed to us, unseal them and
    /// hand the extended pairing response to `callback`.
    ///
    /// Payloads that do not authenticate under our key are dropped silently:
    /// the substrate broadcasts to every subscriber and most traffic is not
    /// addressed to us.
    pub async fn listen_for_channel_opening<F>(&self, callback: F) -> P2pResult<()>
    where
        F: Fn(ExtendedPairingResponse) + Send + Sync + 'static,
    {
        let client = self.client().await?;
        let mut events = client.subscribe();
        let local_hash = self.identity.public_key_hash_hex();
        let secret = self.identity.x25519_secret();
        let public = self.identity.x25519_public();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChatEvent::Message { message, .. }) => {
                        if message.kind != MessageKind::Text
                            || !is_channel_open_for(&message.content, &local_hash)
                        {
                            continue;
                        }
                        let Ok(sealed) = channel_open_payload(&message.content) else {
                            continue;
                        };
                        let Ok(plaintext) = crypto::open(&sealed, &secret, &public) else {
                            continue;
                        };
                        match parse_pairing_response(&plaintext) {
                            Ok(info) => {
                                let Ok(peer_pk) = info.public_key_bytes() else {
                                    continue;
                                };
                                callback(ExtendedPairingResponse {
                                    sender_id: sender_id(&peer_pk),
                                    info,
                                });
                            }
                            Err(e) => {
                                debug!(error = %e, "Ignoring malformed channel-open payload");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Channel-open listener lagged behind event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        self.listener_tasks.lock().push(handle);
        Ok(())
    }

    /// Answer a pairing request: resolve a room for the requester, wait for
    /// them to join, then send the sealed response tagged `@channel-open`.
    pub async fn send_pairing_response(&self, request: &PairingInfo) -> P2pResult<()> {
        let client = self.client().await?;
        let recipient = request.recipient_address()?;
        let room_id = self
            .router
            .relevant_room(&client, &recipient, self.config.wallet)
            .await?;

        wait_for_members(&client, &room_id).await?;

        let response = self.pairing_response_info(request)?;
        let payload = serde_json::to_vec(&response)?;
        let peer_x25519 = x25519_public_from_ed25519(&request.public_key_bytes()?)?;
        let sealed = crypto::seal(&payload, &peer_x25519)?;

        info!(recipient = %recipient, room_id = %room_id, "Sending pairing response");
        client
            .send_text_message(&room_id, &channel_open_text(&recipient, &sealed))
            .await?;
        Ok(())
    }

    /// Send key towards `peer`: we take the KX client role.
    fn tx_key(&self, peer_public_key: &[u8; 32]) -> P2pResult<SymmetricKey> {
        let cache_key = hex::encode(peer_public_key);
        if let Some(key) = self.tx_keys.lock().get(&cache_key) {
            return Ok(*key);
        }
        let peer_x25519 = x25519_public_from_ed25519(peer_public_key)?;
        let keys = crypto::client_session_keys(
            &self.identity.x25519_secret(),
            &self.identity.x25519_public(),
            &peer_x25519,
        );
        self.tx_keys.lock().insert(cache_key, keys.tx);
        Ok(keys.tx)
    }

    /// Receive key from `peer`: we take the KX server role.
    fn rx_key(&self, peer_public_key: &[u8; 32]) -> P2pResult<SymmetricKey> {
        let cache_key = hex::encode(peer_public_key);
        if let Some(key) = self.rx_keys.lock().get(&cache_key) {
            return Ok(*key);
        }
        let peer_x25519 = x25519_public_from_ed25519(peer_public_key)?;
        let keys = crypto::server_session_keys(
            &self.identity.x25519_secret(),
            &self.identity.x25519_public(),
            &peer_x25519,
        );
        self.rx_keys.lock().insert(cache_key, keys.rx);
        Ok(keys.rx)
    }

    /// Decrypt session traffic from one sender and hand plaintexts to
    /// `callback`. Idempotent per sender. Messages that fail to decode or
    /// authenticate are dropped silently.
    ///
    /// If the startup capture listener holds a recent message it is replayed
    /// through the new callback once; the capture listener is then retired.
    pub async fn listen_for_encrypted_messages<F>(
        &self,
        sender_public_key: &[u8; 32],
        callback: F,
    ) -> P2pResult<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let client = self.client().await?;
        let listener_key = hex::encode(sender_public_key);
        if self.message_listeners.lock().contains_key(&listener_key) {
            return Ok(());
        }

        let rx = self.rx_key(sender_public_key)?;
        let sender_prefix = format!("@{}", hex::encode(crypto::generic_hash(sender_public_key)));
        let callback = Arc::new(callback);

        let mut events = client.subscribe();
        let task_rx = rx;
        let task_prefix = sender_prefix.clone();
        let task_callback = callback.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChatEvent::Message { message, .. }) => {
                        if let Some(plaintext) = decrypt_addressed(
                            &task_rx,
                            &task_prefix,
                            message.kind,
                            &message.sender,
                            &message.content,
                        ) {
                            (*task_callback)(plaintext);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Message listener lagged behind event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        self.message_listeners.lock().insert(listener_key, handle);

        // Replay an early message captured during startup, then retire the
        // capture listener; it only exists to cover this gap.
        let held = self.captured.lock().clone();
        if let Some(held) = held {
            if held.received_at.elapsed() <= CAPTURE_REPLAY_WINDOW {
                if let Some(plaintext) = decrypt_addressed(
                    &rx,
                    &sender_prefix,
                    MessageKind::Text,
                    &held.sender,
                    &held.content,
                ) {
                    (*callback)(plaintext);
                }
            }
        }
        if let Some(handle) = self.capture_task.lock().take() {
            handle.abort();
        }
        *self.captured.lock() = None;

        Ok(())
    }

    /// Encrypt `message` for `peer` and send it into their room. A
    /// forbidden send evicts the stale binding and retries once into a
    /// freshly resolved room; retry errors are logged, not surfaced.
    pub async fn send_message(&self, message: &str, peer: &PairingInfo) -> P2pResult<()> {
        let client = self.client().await?;
        let tx = self.tx_key(&peer.public_key_bytes()?)?;
        let recipient = peer.recipient_address()?;

        let payload = hex::encode(crypto::encrypt(&tx, message.as_bytes())?);
        let room_id = self
            .router
            .relevant_room(&client, &recipient, self.config.wallet)
            .await?;

        match client.send_text_message(&room_id, &payload).await {
            Ok(_) => Ok(()),
            Err(P2pError::Forbidden(reason)) => {
                info!(room_id = %room_id, reason = %reason, "Send forbidden, rebinding room");
                self.router.evict_room(&room_id)?;
                let fresh = self
                    .router
                    .relevant_room(&client, &recipient, self.config.wallet)
                    .await?;
                if let Err(e) = client.send_text_message(&fresh, &payload).await {
                    warn!(room_id = %fresh, error = %e, "Retry send failed");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Shared receive-path filter: text, sender match, hex, authenticate.
fn decrypt_addressed(
    rx: &SymmetricKey,
    sender_prefix: &str,
    kind: MessageKind,
    sender: &str,
    content: &str,
) -> Option<String> {
    if kind != MessageKind::Text || !sender.starts_with(sender_prefix) {
        return None;
    }
    let bytes = hex::decode(content).ok()?;
    let plaintext = crypto::decrypt(rx, &bytes).ok()?;
    String::from_utf8(plaintext).ok()
}

/// Join with bounded retries on "forbidden"; other errors are abandoned.
async fn try_join_rooms(client: &Arc<ChatClient>, room_id: &str) {
    for attempt in 1..=JOIN_MAX_ATTEMPTS {
        match client.join_rooms(&[room_id.to_string()]).await {
            Ok(()) => return,
            Err(P2pError::Forbidden(_)) if attempt < JOIN_MAX_ATTEMPTS => {
                debug!(room_id = %room_id, attempt, "Join forbidden, retrying");
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
            }
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Failed to join room");
                return;
            }
        }
    }
}

/// Poll until the room has at least two members (them and us).
async fn wait_for_members(client: &Arc<ChatClient>, room_id: &str) -> P2pResult<()> {
    for attempt in 0..MEMBER_WAIT_MAX_ATTEMPTS {
        if let Some(room) = client.get_room_by_id(room_id).await? {
            if room.members.len() >= 2 {
                return Ok(());
            }
        }
        let delay = if attempt < MEMBER_WAIT_FAST_ATTEMPTS {
            MEMBER_WAIT_FAST
        } else {
            MEMBER_WAIT_SLOW
        };
        tokio::time::sleep(delay).await;
    }
    Err(P2pError::Timeout(format!(
        "Counterparty never joined room {}",
        room_id
    )))
}
