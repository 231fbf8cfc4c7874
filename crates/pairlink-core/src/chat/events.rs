//! Events published by the chat client

use crate::types::RoomMessage;

/// Events emitted from the sync loop.
///
/// A closed set: subscribers match on the variant they care about. The
/// pairing core only consumes text `Message`s and `Invite`s.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message arrived in a room we are a member of
    Message {
        room_id: String,
        message: RoomMessage,
    },
    /// We were invited to a room
    Invite { room_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageKind;

    #[test]
    fn test_events_are_cloneable_for_broadcast() {
        let event = ChatEvent::Message {
            room_id: "!a:relay".into(),
            message: RoomMessage {
                kind: MessageKind::Text,
                content: "hi".into(),
                sender: "@x:relay".into(),
                timestamp: 1,
            },
        };
        let cloned = event.clone();
        match cloned {
            ChatEvent::Message { room_id, .. } => assert_eq!(room_id, "!a:relay"),
            _ => panic!("wrong variant"),
        }
    }
}
