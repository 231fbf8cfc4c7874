//! Core room and message types

use serde::{Deserialize, Serialize};

/// Kind of a chat message. Only text carries pairing or session traffic;
/// everything else is passed through for completeness and ignored upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Other,
}

/// A message observed in a room during sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub kind: MessageKind,
    pub content: String,
    /// Chat-layer sender address, e.g. `@<hash>:<relay>`
    pub sender: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Membership status of a room from the local peer's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Unknown,
    Joined,
    Invited,
    Left,
}

/// A room on the chat substrate.
///
/// `messages` is transient: it accumulates within a session and is cleared
/// before the room is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub status: RoomStatus,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub messages: Vec<RoomMessage>,
}

impl Room {
    pub fn new(id: impl Into<String>, status: RoomStatus) -> Self {
        Self {
            id: id.into(),
            status,
            members: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_members(mut self, members: Vec<String>) -> Self {
        self.members = members;
        self
    }

    /// Merge a newer snapshot of the same room into this one.
    ///
    /// The incoming status wins unless it is `Unknown` (which carries no
    /// information); members are unioned; messages are appended.
    pub fn merge(&mut self, incoming: Room) {
        if incoming.status != RoomStatus::Unknown {
            self.status = incoming.status;
        }
        for member in incoming.members {
            if !self.members.contains(&member) {
                self.members.push(member);
            }
        }
        self.messages.extend(incoming.messages);
    }

    pub fn has_member(&self, address: &str) -> bool {
        self.members.iter().any(|m| m == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_status_upgrade() {
        let mut room = Room::new("!a:relay", RoomStatus::Invited);
        room.merge(Room::new("!a:relay", RoomStatus::Joined));
        assert_eq!(room.status, RoomStatus::Joined);
    }

    #[test]
    fn test_merge_unknown_keeps_status() {
        let mut room = Room::new("!a:relay", RoomStatus::Joined);
        room.merge(Room::new("!a:relay", RoomStatus::Unknown));
        assert_eq!(room.status, RoomStatus::Joined);
    }

    #[test]
    fn test_merge_members_are_unioned() {
        let mut room = Room::new("!a:relay", RoomStatus::Joined)
            .with_members(vec!["@x:relay".into(), "@y:relay".into()]);
        room.merge(
            Room::new("!a:relay", RoomStatus::Joined)
                .with_members(vec!["@y:relay".into(), "@z:relay".into()]),
        );
        assert_eq!(room.members, vec!["@x:relay", "@y:relay", "@z:relay"]);
    }

    #[test]
    fn test_merge_appends_messages() {
        let mut room = Room::new("!a:relay", RoomStatus::Joined);
        room.messages.push(RoomMessage {
            kind: MessageKind::Text,
            content: "one".into(),
            sender: "@x:relay".into(),
            timestamp: 1,
        });

        let mut incoming = Room::new("!a:relay", RoomStatus::Joined);
        incoming.messages.push(RoomMessage {
            kind: MessageKind::Text,
            content: "two".into(),
            sender: "@y:relay".into(),
            timestamp: 2,
        });

        room.merge(incoming);
        assert_eq!(room.messages.len(), 2);
    }
}
