//! HTTP implementation of [`ChatNode`]
//!
//! Speaks the federation's client-server API (Matrix r0 shapes). All JSON
//! handling lives here; the rest of the crate only sees the typed DTOs
//! from [`super::node`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use super::node::{ChatNode, LoginRequest, LoginSession, RoomDelta, SyncDelta};
use crate::error::{P2pError, P2pResult};
use crate::types::{MessageKind, RoomMessage};

/// Slack added on top of the server-side long-poll hold time.
const REQUEST_TIMEOUT_SLACK_MS: u64 = 10_000;

pub struct HttpChatNode {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpChatNode {
    /// Build a node client for `base_url` (e.g. `https://matrix.papers.tech`).
    pub fn connect(base_url: &str) -> P2pResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| P2pError::Network(format!("Invalid node URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(P2pError::Http)?;
        Ok(Self { base_url, client })
    }

    /// `base/_matrix/client/r0/<segments...>` with proper escaping of room
    /// and transaction ids.
    fn api_url(&self, segments: &[&str]) -> P2pResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| P2pError::Network("Node URL cannot be a base".to_string()))?;
            path.pop_if_empty();
            path.extend(["_matrix", "client", "r0"]);
            path.extend(segments);
        }
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> P2pResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::FORBIDDEN || body.contains("M_FORBIDDEN") {
            Err(P2pError::Forbidden(body))
        } else {
            Err(P2pError::Network(format!("HTTP {}: {}", status, body)))
        }
    }
}

// ─── Raw wire shapes ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawLoginResponse {
    user_id: String,
    access_token: String,
    #[serde(default)]
    device_id: String,
}

#[derive(Deserialize)]
struct RawSyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: RawRooms,
}

#[derive(Deserialize, Default)]
struct RawRooms {
    #[serde(default)]
    join: HashMap<String, RawJoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, serde_json::Value>,
    #[serde(default)]
    leave: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawJoinedRoom {
    #[serde(default)]
    state: RawTimeline,
    #[serde(default)]
    timeline: RawTimeline,
}

#[derive(Deserialize, Default)]
struct RawTimeline {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct RawRoomIdResponse {
    room_id: String,
}

#[derive(Deserialize)]
struct RawEventIdResponse {
    event_id: String,
}

fn room_delta(room_id: &str, raw: &RawJoinedRoom) -> RoomDelta {
    let mut delta = RoomDelta {
        room_id: room_id.to_string(),
        ..Default::default()
    };

    for event in raw.state.events.iter().chain(raw.timeline.events.iter()) {
        match event.kind.as_str() {
            "m.room.member" => {
                let membership = event.content.get("membership").and_then(|m| m.as_str());
                if membership == Some("join") {
                    if let Some(member) = event.state_key.as_deref() {
                        if !delta.members.iter().any(|m| m == member) {
                            delta.members.push(member.to_string());
                        }
                    }
                }
            }
            "m.room.message" => {
                let msgtype = event.content.get("msgtype").and_then(|m| m.as_str());
                let body = event
                    .content
                    .get("body")
                    .and_then(|b| b.as_str())
                    .unwrap_or_default();
                delta.messages.push(RoomMessage {
                    kind: if msgtype == Some("m.text") {
                        MessageKind::Text
                    } else {
                        MessageKind::Other
                    },
                    content: body.to_string(),
                    sender: event.sender.clone(),
                    timestamp: event.origin_server_ts,
                });
            }
            _ => {}
        }
    }

    delta
}

#[async_trait]
impl ChatNode for HttpChatNode {
    async fn login(&self, request: &LoginRequest) -> P2pResult<LoginSession> {
        let url = self.api_url(&["login"])?;
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": request.user },
            "password": request.password,
            "device_id": request.device_id,
        });

        let response = self.client.post(url).json(&body).send().await?;
        let raw: RawLoginResponse = Self::check(response).await?.json().await?;
        Ok(LoginSession {
            user_id: raw.user_id,
            access_token: raw.access_token,
            device_id: if raw.device_id.is_empty() {
                request.device_id.clone()
            } else {
                raw.device_id
            },
        })
    }

    async fn sync(
        &self,
        access_token: &str,
        since: Option<&str>,
        timeout_ms: u64,
    ) -> P2pResult<SyncDelta> {
        let url = self.api_url(&["sync"])?;
        let mut request = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .timeout(Duration::from_millis(timeout_ms + REQUEST_TIMEOUT_SLACK_MS))
            .query(&[("timeout", timeout_ms.to_string())]);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = request.send().await?;
        let raw: RawSyncResponse = Self::check(response).await?.json().await?;

        Ok(SyncDelta {
            next_batch: raw.next_batch,
            joined: raw
                .rooms
                .join
                .iter()
                .map(|(id, room)| room_delta(id, room))
                .collect(),
            invited: raw.rooms.invite.keys().cloned().collect(),
            left: raw.rooms.leave.keys().cloned().collect(),
        })
    }

    async fn send_text(
        &self,
        access_token: &str,
        room_id: &str,
        body: &str,
        txn_id: &str,
    ) -> P2pResult<String> {
        let url = self.api_url(&["rooms", room_id, "send", "m.room.message", txn_id])?;
        let payload = json!({ "msgtype": "m.text", "body": body });

        let response = self
            .client
            .put(url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await?;
        let raw: RawEventIdResponse = Self::check(response).await?.json().await?;
        Ok(raw.event_id)
    }

    async fn create_room(&self, access_token: &str, invitees: &[String]) -> P2pResult<String> {
        let url = self.api_url(&["createRoom"])?;
        let body = json!({
            "preset": "trusted_private_chat",
            "is_direct": true,
            "invite": invitees,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        let raw: RawRoomIdResponse = Self::check(response).await?.json().await?;
        Ok(raw.room_id)
    }

    async fn invite(&self, access_token: &str, room_id: &str, user_id: &str) -> P2pResult<()> {
        let url = self.api_url(&["rooms", room_id, "invite"])?;
        let body = json!({ "user_id": user_id });

        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn join(&self, access_token: &str, room_id: &str) -> P2pResult<()> {
        let url = self.api_url(&["rooms", room_id, "join"])?;

        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&json!({}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
