use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    VoiceNote,
    Gif,
}

/// One message in a conversation. An optimistic (not yet server-confirmed)
/// message carries a locally generated id and `pending = true`; reconciliation
/// replaces it wholesale with the server copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// None for pure media messages.
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Voice notes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gif_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gif_height: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pending: bool,
}

impl Message {
    /// Minimal text message constructor used by the optimistic-send path.
    pub fn text(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: Some(content.into()),
            kind: MessageKind::Text,
            media_url: None,
            duration_secs: None,
            waveform: None,
            gif_width: None,
            gif_height: None,
            created_at: Utc::now(),
            pending: false,
        }
    }

    pub fn is_own(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id
    }
}

/// Per-conversation bounded message log plus pagination cursors.
///
/// `messages` is chronological; `oldest_id`/`newest_id` always mirror the
/// first/last element (None when empty) and serve as pagination cursors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLog {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
    pub oldest_id: Option<Uuid>,
    pub newest_id: Option<Uuid>,
    pub last_sync: DateTime<Utc>,
}

impl ConversationLog {
    pub fn empty(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            oldest_id: None,
            newest_id: None,
            last_sync: Utc::now(),
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Recompute the oldest/newest cursors from the current sequence.
    pub fn refresh_cursors(&mut self) {
        self.oldest_id = self.messages.first().map(|m| m.id);
        self.newest_id = self.messages.last().map(|m| m.id);
    }
}

/// Which logical participant of an assisted session a user is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    ParticipantA,
    ParticipantB,
}

impl ParticipantRole {
    pub fn counterpart(self) -> Self {
        match self {
            Self::ParticipantA => Self::ParticipantB,
            Self::ParticipantB => Self::ParticipantA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Exited,
}

/// Assisted-conversation session. The backend is authoritative; local copies
/// are short-TTL snapshots. Opt-in flags are meaningful only while status is
/// `Pending` or `Exited`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSession {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub participant_a_id: Uuid,
    pub participant_b_id: Uuid,
    pub participant_a_opted_in: bool,
    pub participant_b_opted_in: bool,
    pub status: SessionStatus,
}

impl HostSession {
    pub fn role_of(&self, user_id: Uuid) -> Option<ParticipantRole> {
        if user_id == self.participant_a_id {
            Some(ParticipantRole::ParticipantA)
        } else if user_id == self.participant_b_id {
            Some(ParticipantRole::ParticipantB)
        } else {
            None
        }
    }

    pub fn opted_in(&self, role: ParticipantRole) -> bool {
        match role {
            ParticipantRole::ParticipantA => self.participant_a_opted_in,
            ParticipantRole::ParticipantB => self.participant_b_opted_in,
        }
    }

    pub fn set_opted_in(&mut self, role: ParticipantRole, value: bool) {
        match role {
            ParticipantRole::ParticipantA => self.participant_a_opted_in = value,
            ParticipantRole::ParticipantB => self.participant_b_opted_in = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSender {
    ParticipantA,
    ParticipantB,
    Host,
}

/// Multiple-choice prompt attached to a host question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPrompt {
    pub question_id: Uuid,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender: HostSender,
    /// None when the host itself is the sender.
    pub sender_id: Option<Uuid>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HostPrompt>,
    pub created_at: DateTime<Utc>,
}
