use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use ember_types::api::{Ack, ConversationResponse, SendMessageRequest, SubmitAnswerRequest};
use ember_types::models::{HostSession, Message};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status} for {path}")]
    Status { status: StatusCode, path: String },
}

/// Request/response client for the authoritative backend. Used for cold
/// loads and as the fallback delivery path when a publish is not echoed in
/// time. The credential is an opaque bearer token; issuing it is someone
/// else's problem.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    token: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: Client::new(),
            base_url,
            token: token.into(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        debug!("GET {}", path);
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status,
                path: path.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        debug!("POST {}", path);
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status,
                path: path.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    /// Fallback send. The response is the canonical server message, which the
    /// reconciler folds over the optimistic copy.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        request: &SendMessageRequest,
    ) -> Result<Message, BackendError> {
        self.post(&format!("/conversations/{}/messages", conversation_id), request)
            .await
    }

    /// Cold load: the authoritative message list for a conversation.
    pub async fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<ConversationResponse, BackendError> {
        self.get(&format!("/conversations/{}", conversation_id)).await
    }

    /// Backward pagination: messages older than the given cursor (the oldest
    /// retained message id from the local log).
    pub async fn get_messages_before(
        &self,
        conversation_id: Uuid,
        before: Uuid,
    ) -> Result<ConversationResponse, BackendError> {
        self.get(&format!(
            "/conversations/{}/messages?before={}",
            conversation_id, before
        ))
        .await
    }

    /// Canonical assisted-session state. `Ok(None)` when no session exists
    /// yet for the conversation.
    pub async fn get_host_session(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<HostSession>, BackendError> {
        match self
            .get(&format!("/conversations/{}/host-session", conversation_id))
            .await
        {
            Ok(session) => Ok(Some(session)),
            Err(BackendError::Status { status, .. }) if status == StatusCode::NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn opt_in(&self, conversation_id: Uuid) -> Result<Ack, BackendError> {
        self.post(
            &format!("/conversations/{}/host-session/opt-in", conversation_id),
            &(),
        )
        .await
    }

    pub async fn opt_out(&self, conversation_id: Uuid) -> Result<Ack, BackendError> {
        self.post(
            &format!("/conversations/{}/host-session/opt-out", conversation_id),
            &(),
        )
        .await
    }

    pub async fn exit_session(&self, conversation_id: Uuid) -> Result<Ack, BackendError> {
        self.post(
            &format!("/conversations/{}/host-session/exit", conversation_id),
            &(),
        )
        .await
    }

    pub async fn submit_answer(
        &self,
        conversation_id: Uuid,
        request: &SubmitAnswerRequest,
    ) -> Result<Ack, BackendError> {
        self.post(
            &format!("/conversations/{}/host-session/answers", conversation_id),
            request,
        )
        .await
    }
}
