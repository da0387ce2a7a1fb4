use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use ember_types::models::{ConversationLog, Message};

use crate::Database;

/// Default retained-message bound per conversation.
pub const DEFAULT_BOUND: usize = 100;

fn conv_key(conversation_id: Uuid) -> String {
    format!("conv:{}", conversation_id)
}

/// Insert `message` into the log preserving chronological order, dropping
/// from the OLDEST end if the bound is exceeded. Appending a message whose id
/// is already present is a no-op. Returns whether the message was inserted.
pub fn merge_append(log: &mut ConversationLog, message: Message, bound: usize) -> bool {
    if log.contains(message.id) {
        return false;
    }

    // Almost always the new message is the newest; walk back only as far as
    // out-of-order delivery requires.
    let mut idx = log.messages.len();
    while idx > 0 && log.messages[idx - 1].created_at > message.created_at {
        idx -= 1;
    }
    log.messages.insert(idx, message);

    if log.messages.len() > bound {
        let excess = log.messages.len() - bound;
        log.messages.drain(..excess);
    }
    log.refresh_cursors();
    true
}

/// Merge a backward-pagination page at the FRONT of the log, dropping from
/// the NEWEST end if the bound is exceeded. Trimming recent history when both
/// directions are filled is the deliberate bound-vs-completeness trade-off:
/// the log cannot grow unboundedly in both directions. Returns how many
/// messages were inserted.
pub fn merge_older(log: &mut ConversationLog, older: Vec<Message>, bound: usize) -> usize {
    let mut page: Vec<Message> = older
        .into_iter()
        .filter(|m| !log.contains(m.id))
        .collect();
    if page.is_empty() {
        log.refresh_cursors();
        return 0;
    }
    page.sort_by_key(|m| m.created_at);
    let inserted = page.len();

    page.append(&mut log.messages);
    log.messages = page;

    if log.messages.len() > bound {
        log.messages.truncate(bound);
    }
    log.refresh_cursors();
    inserted
}

/// Per-conversation bounded message log persisted across process restarts.
///
/// Mutating operations for one conversation must be serialized by the caller
/// (the engine holds a per-conversation lock); the database mutex only
/// serializes individual statements.
#[derive(Clone)]
pub struct LocalMessageStore {
    db: Arc<Database>,
    bound: usize,
}

impl LocalMessageStore {
    pub fn new(db: Arc<Database>, bound: usize) -> Self {
        Self { db, bound }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Load a conversation log. Read or deserialization failures are treated
    /// as a miss: logged, the stale record dropped, never fatal.
    pub fn load(&self, conversation_id: Uuid) -> Option<ConversationLog> {
        let key = conv_key(conversation_id);
        let row = match self.db.get_record(&key) {
            Ok(row) => row?,
            Err(e) => {
                warn!("conversation {} read failed: {}", conversation_id, e);
                return None;
            }
        };
        match serde_json::from_str(&row.payload) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(
                    "conversation {} record corrupt, dropping: {}",
                    conversation_id, e
                );
                let _ = self.db.delete_record(&key);
                None
            }
        }
    }

    /// Persist a log produced by an out-of-store mutation (reconciliation).
    pub fn persist(&self, log: &ConversationLog) -> Result<()> {
        let payload = serde_json::to_string(log)?;
        self.db
            .put_record(&conv_key(log.conversation_id), &payload, Utc::now())
    }

    pub fn append(&self, conversation_id: Uuid, message: Message) -> Result<ConversationLog> {
        let mut log = self
            .load(conversation_id)
            .unwrap_or_else(|| ConversationLog::empty(conversation_id));
        merge_append(&mut log, message, self.bound);
        self.persist(&log)?;
        Ok(log)
    }

    pub fn prepend_older(
        &self,
        conversation_id: Uuid,
        older: Vec<Message>,
    ) -> Result<ConversationLog> {
        let mut log = self
            .load(conversation_id)
            .unwrap_or_else(|| ConversationLog::empty(conversation_id));
        merge_older(&mut log, older, self.bound);
        self.persist(&log)?;
        Ok(log)
    }

    /// Replace the log with a server snapshot (cold load). Keeps the newest
    /// `bound` messages and stamps `last_sync`.
    pub fn save_messages(
        &self,
        conversation_id: Uuid,
        mut messages: Vec<Message>,
    ) -> Result<ConversationLog> {
        messages.sort_by_key(|m| m.created_at);
        if messages.len() > self.bound {
            let excess = messages.len() - self.bound;
            messages.drain(..excess);
        }

        let mut log = ConversationLog::empty(conversation_id);
        log.messages = messages;
        log.last_sync = Utc::now();
        log.refresh_cursors();
        self.persist(&log)?;
        Ok(log)
    }

    pub fn touch_sync(&self, conversation_id: Uuid) -> Result<()> {
        if let Some(mut log) = self.load(conversation_id) {
            log.last_sync = Utc::now();
            self.persist(&log)?;
        }
        Ok(())
    }

    /// Remove all local data for a conversation (unmatch / logout).
    pub fn clear(&self, conversation_id: Uuid) -> Result<()> {
        self.db.delete_record(&conv_key(conversation_id))
    }

    /// Remove every conversation log (logout).
    pub fn clear_all(&self) -> Result<usize> {
        self.db.delete_prefix("conv:")
    }
}
