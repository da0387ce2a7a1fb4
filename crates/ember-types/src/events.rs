use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{HostMessage, Message};

/// Events delivered over the push channel. Every event is scoped to the room
/// it was emitted in; delivery order is guaranteed only within one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelEvent {
    /// A message was posted to the conversation. When the message is the echo
    /// of a publish from this client, `correlation_id` carries the temporary
    /// id the sender attached.
    NewMessage {
        room_id: Uuid,
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<Uuid>,
    },

    /// A participant opted in to the assisted-conversation mode.
    HostOptIn { room_id: Uuid, session_id: Uuid },

    /// The host (or a participant, relayed by the host) posted a message
    /// inside an active assisted session.
    HostMessage {
        room_id: Uuid,
        session_id: Uuid,
        message: HostMessage,
    },

    /// The host withdrew; the session is complete and normal messaging resumes.
    HostHandoff { room_id: Uuid },

    /// A participant exited the assisted session.
    HostExited { room_id: Uuid },
}

impl ChannelEvent {
    pub fn room_id(&self) -> Uuid {
        match self {
            Self::NewMessage { room_id, .. }
            | Self::HostOptIn { room_id, .. }
            | Self::HostMessage { room_id, .. }
            | Self::HostHandoff { room_id }
            | Self::HostExited { room_id } => *room_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage { .. } => EventKind::NewMessage,
            Self::HostOptIn { .. } => EventKind::HostOptIn,
            Self::HostMessage { .. } => EventKind::HostMessage,
            Self::HostHandoff { .. } => EventKind::HostHandoff,
            Self::HostExited { .. } => EventKind::HostExited,
        }
    }
}

/// Discriminant used by subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    HostOptIn,
    HostMessage,
    HostHandoff,
    HostExited,
}

/// Commands sent FROM the client TO the server over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelCommand {
    JoinRoom { room_id: Uuid },

    LeaveRoom { room_id: Uuid },

    /// Fire-and-forget publish. The `NewMessage` echo carrying the same
    /// `correlation_id` is the delivery acknowledgment.
    SendMessage {
        conversation_id: Uuid,
        content: String,
        correlation_id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_round_trips_through_json() {
        let room = Uuid::new_v4();
        let event = ChannelEvent::HostOptIn {
            room_id: room,
            session_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"HostOptIn\""));

        let back: ChannelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.room_id(), room);
        assert_eq!(back.kind(), EventKind::HostOptIn);
    }

    #[test]
    fn test_new_message_without_correlation_id_deserializes() {
        let msg = crate::models::Message::text(Uuid::new_v4(), Uuid::new_v4(), "hey");
        let json = serde_json::json!({
            "type": "NewMessage",
            "data": { "room_id": msg.conversation_id, "message": msg }
        });
        let event: ChannelEvent = serde_json::from_value(json).unwrap();
        match event {
            ChannelEvent::NewMessage { correlation_id, .. } => assert!(correlation_id.is_none()),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
