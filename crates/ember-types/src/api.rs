use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageKind};

// -- Messages --

/// Fallback/cold-path send. `correlation_id` is the optimistic message's
/// temporary id so the server can tag the echo for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    pub correlation_id: Uuid,
}

impl SendMessageRequest {
    pub fn text(content: impl Into<String>, correlation_id: Uuid) -> Self {
        Self {
            content: Some(content.into()),
            kind: MessageKind::Text,
            media_ref: None,
            correlation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub messages: Vec<Message>,
}

// -- Assisted sessions --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnswerRequest {
    pub question_id: Uuid,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}
