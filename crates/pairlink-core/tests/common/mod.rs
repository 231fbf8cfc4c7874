//! In-memory federation double shared by integration tests
//!
//! Implements [`ChatNode`] over a single process-local "federation" so two
//! engines can run the full pairing handshake and session traffic without a
//! server. Behavior mirrors what the core relies on: invites fan out to the
//! invitee, joins fan membership out to every member, messages fan out to
//! all joined members, and sends into unknown rooms come back forbidden.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use pairlink_core::chat::{ChatNode, LoginRequest, LoginSession, RoomDelta, SyncDelta};
use pairlink_core::{
    Config, Identity, MemoryStorage, MessageKind, P2pError, P2pResult, PairingEngine, RoomMessage,
};

pub const RELAY: &str = "mock.relay";

#[derive(Default)]
struct MockRoom {
    joined: Vec<String>,
    invited: Vec<String>,
}

#[derive(Default)]
struct FederationState {
    rooms: HashMap<String, MockRoom>,
    queues: HashMap<String, Vec<SyncDelta>>,
    /// Accepted sends: (room_id, body, sender)
    sends: Vec<(String, String, String)>,
    /// Every send attempt by room, accepted or rejected
    attempts: Vec<String>,
    next_room: u64,
    next_batch: u64,
}

#[derive(Default)]
pub struct MockFederation {
    state: Mutex<FederationState>,
}

impl MockFederation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All `(room_id, body, sender)` sends accepted so far.
    pub fn sends(&self) -> Vec<(String, String, String)> {
        self.state.lock().sends.clone()
    }

    pub fn sends_into(&self, room_id: &str) -> usize {
        self.state
            .lock()
            .sends
            .iter()
            .filter(|(room, _, _)| room == room_id)
            .count()
    }

    /// Total send attempts, including forbidden ones.
    pub fn send_attempts(&self) -> usize {
        self.state.lock().attempts.len()
    }

    fn push(state: &mut FederationState, user: &str, delta: SyncDelta) {
        state.queues.entry(user.to_string()).or_default().push(delta);
    }
}

pub struct MockNode {
    federation: Arc<MockFederation>,
    user: Mutex<Option<String>>,
}

impl MockNode {
    pub fn new(federation: Arc<MockFederation>) -> Self {
        Self {
            federation,
            user: Mutex::new(None),
        }
    }

    fn current_user(&self) -> P2pResult<String> {
        self.user
            .lock()
            .clone()
            .ok_or_else(|| P2pError::Network("Not logged in".to_string()))
    }
}

#[async_trait]
impl ChatNode for MockNode {
    async fn login(&self, request: &LoginRequest) -> P2pResult<LoginSession> {
        if !request.password.starts_with("ed:") {
            return Err(P2pError::Network("Bad login credential".to_string()));
        }
        let user_id = format!("@{}:{}", request.user, RELAY);
        *self.user.lock() = Some(user_id.clone());
        Ok(LoginSession {
            user_id: user_id.clone(),
            access_token: format!("token-{}", user_id),
            device_id: request.device_id.clone(),
        })
    }

    async fn sync(
        &self,
        _access_token: &str,
        _since: Option<&str>,
        _timeout_ms: u64,
    ) -> P2pResult<SyncDelta> {
        let user = self.current_user()?;
        // Short poll keeps the loop responsive without a real long-poll.
        for _ in 0..8 {
            {
                let mut state = self.federation.state.lock();
                let queue = state.queues.entry(user.clone()).or_default();
                if !queue.is_empty() {
                    let pending: Vec<SyncDelta> = queue.drain(..).collect();
                    state.next_batch += 1;
                    let mut merged = SyncDelta {
                        next_batch: format!("s{}", state.next_batch),
                        ..Default::default()
                    };
                    for delta in pending {
                        merged.joined.extend(delta.joined);
                        merged.invited.extend(delta.invited);
                        merged.left.extend(delta.left);
                    }
                    return Ok(merged);
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let mut state = self.federation.state.lock();
        state.next_batch += 1;
        Ok(SyncDelta {
            next_batch: format!("s{}", state.next_batch),
            ..Default::default()
        })
    }

    async fn send_text(
        &self,
        _access_token: &str,
        room_id: &str,
        body: &str,
        txn_id: &str,
    ) -> P2pResult<String> {
        let sender = self.current_user()?;
        let mut state = self.federation.state.lock();
        state.attempts.push(room_id.to_string());

        let Some(room) = state.rooms.get(room_id) else {
            return Err(P2pError::Forbidden(format!(
                "M_FORBIDDEN: unknown room {}",
                room_id
            )));
        };
        if !room.joined.contains(&sender) {
            return Err(P2pError::Forbidden(format!(
                "M_FORBIDDEN: {} is not in {}",
                sender, room_id
            )));
        }

        let members = room.joined.clone();
        state
            .sends
            .push((room_id.to_string(), body.to_string(), sender.clone()));
        let message = RoomMessage {
            kind: MessageKind::Text,
            content: body.to_string(),
            sender: sender.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        for member in members {
            MockFederation::push(
                &mut state,
                &member,
                SyncDelta {
                    joined: vec![RoomDelta {
                        room_id: room_id.to_string(),
                        members: Vec::new(),
                        messages: vec![message.clone()],
                    }],
                    ..Default::default()
                },
            );
        }

        Ok(format!("${}", txn_id))
    }

    async fn create_room(&self, _access_token: &str, invitees: &[String]) -> P2pResult<String> {
        let creator = self.current_user()?;
        let mut state = self.federation.state.lock();
        state.next_room += 1;
        let room_id = format!("!room{}:{}", state.next_room, RELAY);

        state.rooms.insert(
            room_id.clone(),
            MockRoom {
                joined: vec![creator],
                invited: invitees.to_vec(),
            },
        );
        for invitee in invitees {
            MockFederation::push(
                &mut state,
                invitee,
                SyncDelta {
                    invited: vec![room_id.clone()],
                    ..Default::default()
                },
            );
        }
        Ok(room_id)
    }

    async fn invite(&self, _access_token: &str, room_id: &str, user_id: &str) -> P2pResult<()> {
        let inviter = self.current_user()?;
        let mut state = self.federation.state.lock();
        let Some(room) = state.rooms.get_mut(room_id) else {
            return Err(P2pError::Forbidden("M_FORBIDDEN: unknown room".to_string()));
        };
        if !room.joined.contains(&inviter) {
            return Err(P2pError::Forbidden(
                "M_FORBIDDEN: inviter not in room".to_string(),
            ));
        }
        if !room.invited.iter().any(|u| u == user_id) {
            room.invited.push(user_id.to_string());
        }
        MockFederation::push(
            &mut state,
            user_id,
            SyncDelta {
                invited: vec![room_id.to_string()],
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn join(&self, _access_token: &str, room_id: &str) -> P2pResult<()> {
        let user = self.current_user()?;
        let mut state = self.federation.state.lock();
        let Some(room) = state.rooms.get_mut(room_id) else {
            return Err(P2pError::Forbidden("M_FORBIDDEN: unknown room".to_string()));
        };
        if !room.invited.iter().any(|u| u == &user) && !room.joined.contains(&user) {
            return Err(P2pError::Forbidden("M_FORBIDDEN: not invited".to_string()));
        }
        room.invited.retain(|u| u != &user);
        if !room.joined.contains(&user) {
            room.joined.push(user.clone());
        }

        let members = room.joined.clone();
        let delta = SyncDelta {
            joined: vec![RoomDelta {
                room_id: room_id.to_string(),
                members: members.clone(),
                messages: Vec::new(),
            }],
            ..Default::default()
        };
        for member in members {
            MockFederation::push(&mut state, &member, delta.clone());
        }
        Ok(())
    }
}

/// Build an engine wired to the shared federation with in-memory storage.
pub fn engine(
    federation: &Arc<MockFederation>,
    name: &str,
    seed: u8,
    wallet: bool,
) -> (PairingEngine, Arc<MemoryStorage>) {
    let mut config = Config::new(name);
    config.relay_nodes = vec![RELAY.to_string()];
    config.wallet = wallet;

    let storage = Arc::new(MemoryStorage::new());
    let federation = federation.clone();
    let engine = PairingEngine::new(
        config,
        Identity::from_secret_bytes(&[seed; 32]),
        storage.clone(),
        Box::new(move |_relay| Ok(Arc::new(MockNode::new(federation.clone())) as Arc<dyn ChatNode>)),
    );
    (engine, storage)
}
