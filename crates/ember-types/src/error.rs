use thiserror::Error;

use crate::models::SessionStatus;

/// Push-channel failures. Recovered via the HTTP fallback or reconnection;
/// surfaced to callers only when both paths are exhausted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("credential rejected by the push endpoint")]
    AuthRejected,

    #[error("push endpoint unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },

    #[error("not connected and no credential available")]
    NotConnected,
}

/// An assisted-session transition was attempted from a state that does not
/// permit it. Handled by refetching the canonical state from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid session transition: {action} while {status:?}")]
pub struct SessionStateError {
    pub action: &'static str,
    pub status: SessionStatus,
}
