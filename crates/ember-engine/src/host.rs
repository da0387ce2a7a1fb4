use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use ember_backend::{BackendClient, BackendError};
use ember_store::cache::{CacheKind, ResponseCache};
use ember_types::api::SubmitAnswerRequest;
use ember_types::error::SessionStateError;
use ember_types::models::{HostSession, ParticipantRole, SessionStatus};

// ── Pure transitions ────────────────────────────────────────────────────
//
// `none → pending → active → {completed, exited}`, `exited → pending` on
// re-opt-in. Session creation is server-side (the backend materializes the
// session lazily on the first opt-in), so the pure layer starts at an
// existing session value.

/// Opt a participant in. Idempotent: opting in twice, or while already
/// active, changes nothing. Returns whether the session became active.
pub fn apply_opt_in(
    session: &mut HostSession,
    role: ParticipantRole,
) -> Result<bool, SessionStateError> {
    match session.status {
        SessionStatus::Pending | SessionStatus::Exited => {
            if session.opted_in(role) && session.status == SessionStatus::Pending {
                return Ok(false);
            }
            if session.status == SessionStatus::Exited {
                // Re-entry: the session cycles back to pending, the opt-in
                // flags start over from this participant.
                session.status = SessionStatus::Pending;
                session.set_opted_in(role.counterpart(), false);
            }
            session.set_opted_in(role, true);
            if session.opted_in(role.counterpart()) {
                session.status = SessionStatus::Active;
                return Ok(true);
            }
            Ok(false)
        }
        SessionStatus::Active => Ok(false),
        SessionStatus::Completed => Err(SessionStateError {
            action: "opt_in",
            status: session.status,
        }),
    }
}

/// Clear only this participant's flag. The session itself persists; the
/// counterpart's flag is remote state and may still be set on next fetch.
pub fn apply_opt_out(
    session: &mut HostSession,
    role: ParticipantRole,
) -> Result<(), SessionStateError> {
    match session.status {
        SessionStatus::Pending | SessionStatus::Exited => {
            session.set_opted_in(role, false);
            Ok(())
        }
        SessionStatus::Active | SessionStatus::Completed => Err(SessionStateError {
            action: "opt_out",
            status: session.status,
        }),
    }
}

/// Either participant exits an active session. Both flags reset so the
/// opt-in banner reappears for whoever has not re-opted-in.
pub fn apply_exit(session: &mut HostSession) -> Result<(), SessionStateError> {
    match session.status {
        SessionStatus::Active => {
            session.status = SessionStatus::Exited;
            session.participant_a_opted_in = false;
            session.participant_b_opted_in = false;
            Ok(())
        }
        status => Err(SessionStateError {
            action: "exit",
            status,
        }),
    }
}

/// Host withdraws: the session completes, history stays visible.
pub fn apply_handoff(session: &mut HostSession) -> Result<(), SessionStateError> {
    match session.status {
        SessionStatus::Active => {
            session.status = SessionStatus::Completed;
            Ok(())
        }
        status => Err(SessionStateError {
            action: "handoff",
            status,
        }),
    }
}

// ── Banner decision ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerState {
    Hidden,
    /// Invite this participant to opt in.
    Invite,
    /// The counterpart already opted in and is waiting on this participant.
    CounterpartWaiting,
}

impl BannerState {
    pub fn visible(self) -> bool {
        self != Self::Hidden
    }
}

/// The single decision function for opt-in banner visibility. `status` is
/// None when no session exists yet. Callers that failed to fetch the session
/// must not call this with a guess — a failed fetch hides the banner
/// outright (see [`HostSessionHandle::banner`]).
pub fn banner_state(
    status: Option<SessionStatus>,
    own_opted_in: bool,
    counterpart_opted_in: bool,
    has_user_messages: bool,
) -> BannerState {
    match status {
        // No session yet: invite only before a plain conversation has
        // gotten going on its own.
        None => {
            if has_user_messages {
                BannerState::Hidden
            } else {
                BannerState::Invite
            }
        }
        Some(SessionStatus::Pending) | Some(SessionStatus::Exited) => {
            if own_opted_in {
                BannerState::Hidden
            } else if counterpart_opted_in {
                BannerState::CounterpartWaiting
            } else {
                BannerState::Invite
            }
        }
        Some(SessionStatus::Active) | Some(SessionStatus::Completed) => BannerState::Hidden,
    }
}

// ── Cache-backed handle ─────────────────────────────────────────────────

/// Local view of one conversation's assisted session. Short-TTL snapshots go
/// through the response cache; the backend stays authoritative and every
/// user action surfaces its failure for UI-level retry.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSnapshot {
    /// Fetch failed: fail closed, present nothing.
    Unavailable,
    /// No session exists yet for this conversation.
    NoSession,
    Current(HostSession),
}

impl SessionSnapshot {
    pub fn session(&self) -> Option<&HostSession> {
        match self {
            Self::Current(session) => Some(session),
            _ => None,
        }
    }
}

pub struct HostSessionHandle {
    conversation_id: Uuid,
    user_id: Uuid,
    backend: BackendClient,
    cache: ResponseCache,
    snapshot_ttl: Duration,
}

impl HostSessionHandle {
    pub fn new(
        conversation_id: Uuid,
        user_id: Uuid,
        backend: BackendClient,
        cache: ResponseCache,
        snapshot_ttl: Duration,
    ) -> Self {
        Self {
            conversation_id,
            user_id,
            backend,
            cache,
            snapshot_ttl,
        }
    }

    fn cache_id(&self) -> String {
        self.conversation_id.to_string()
    }

    fn local_role(&self, session: &HostSession) -> Option<ParticipantRole> {
        session.role_of(self.user_id)
    }

    /// Current session state, served from the cache inside the snapshot TTL.
    /// Absence is cached too ("no session" is a valid answer).
    pub async fn snapshot(&self) -> SessionSnapshot {
        let id = self.cache_id();
        if let Some(cached) = self
            .cache
            .get::<Option<HostSession>>(CacheKind::HostSession, &id, self.snapshot_ttl)
        {
            return match cached {
                Some(session) => SessionSnapshot::Current(session),
                None => SessionSnapshot::NoSession,
            };
        }

        match self.backend.get_host_session(self.conversation_id).await {
            Ok(session) => {
                self.cache.set(CacheKind::HostSession, &id, &session);
                match session {
                    Some(session) => SessionSnapshot::Current(session),
                    None => SessionSnapshot::NoSession,
                }
            }
            Err(e) => {
                warn!(
                    "host session fetch failed for {}: {}",
                    self.conversation_id, e
                );
                SessionSnapshot::Unavailable
            }
        }
    }

    /// Banner visibility, fail-closed on an unavailable snapshot.
    pub async fn banner(&self, has_user_messages: bool) -> BannerState {
        match self.snapshot().await {
            SessionSnapshot::Unavailable => BannerState::Hidden,
            SessionSnapshot::NoSession => {
                banner_state(None, false, false, has_user_messages)
            }
            SessionSnapshot::Current(session) => {
                let Some(role) = self.local_role(&session) else {
                    return BannerState::Hidden;
                };
                banner_state(
                    Some(session.status),
                    session.opted_in(role),
                    session.opted_in(role.counterpart()),
                    has_user_messages,
                )
            }
        }
    }

    /// Opt the local user in. No-op if already opted in. The backend call
    /// failure propagates so the UI can retry.
    pub async fn opt_in(&self) -> Result<SessionSnapshot, BackendError> {
        if let SessionSnapshot::Current(session) = self.snapshot().await {
            if let Some(role) = self.local_role(&session) {
                let already_in = match session.status {
                    SessionStatus::Pending => session.opted_in(role),
                    SessionStatus::Active | SessionStatus::Completed => true,
                    SessionStatus::Exited => false,
                };
                if already_in {
                    return Ok(SessionSnapshot::Current(session));
                }
            }
        }

        self.backend.opt_in(self.conversation_id).await?;
        Ok(self.refetch().await)
    }

    /// Clear the local user's flag. The session is not deleted; the remote
    /// state stays authoritative.
    pub async fn opt_out(&self) -> Result<SessionSnapshot, BackendError> {
        self.backend.opt_out(self.conversation_id).await?;

        // Apply locally too so the banner hides without waiting on a fetch.
        let id = self.cache_id();
        if let SessionSnapshot::Current(mut session) = self.snapshot().await {
            if let Some(role) = self.local_role(&session) {
                if apply_opt_out(&mut session, role).is_ok() {
                    self.cache
                        .set(CacheKind::HostSession, &id, &Some(session.clone()));
                    return Ok(SessionSnapshot::Current(session));
                }
            }
        }
        Ok(self.refetch().await)
    }

    /// Exit an active session. An out-of-state exit is not guessed around:
    /// warn and refetch the canonical state instead.
    pub async fn exit(&self) -> Result<SessionSnapshot, BackendError> {
        if let SessionSnapshot::Current(mut session) = self.snapshot().await {
            match apply_exit(&mut session) {
                Ok(()) => {
                    self.backend.exit_session(self.conversation_id).await?;
                    self.cache
                        .set(CacheKind::HostSession, &self.cache_id(), &Some(session.clone()));
                    return Ok(SessionSnapshot::Current(session));
                }
                Err(e) => warn!("{}; refetching canonical state", e),
            }
        }
        Ok(self.refetch().await)
    }

    pub async fn submit_answer(
        &self,
        question_id: Uuid,
        answer: impl Into<String>,
    ) -> Result<(), BackendError> {
        let request = SubmitAnswerRequest {
            question_id,
            answer: answer.into(),
        };
        self.backend
            .submit_answer(self.conversation_id, &request)
            .await?;
        Ok(())
    }

    /// Fold a counterpart-action event from the push channel into the cached
    /// snapshot. Transitions that do not apply cleanly fall back to a
    /// refetch — remote state wins over local guessing.
    pub async fn apply_remote(&self, transition: RemoteTransition) {
        let id = self.cache_id();
        if let SessionSnapshot::Current(mut session) = self.snapshot().await {
            let result = match transition {
                RemoteTransition::Handoff => apply_handoff(&mut session),
                RemoteTransition::Exited => apply_exit(&mut session),
            };
            match result {
                Ok(()) => {
                    self.cache.set(CacheKind::HostSession, &id, &Some(session));
                    return;
                }
                Err(e) => warn!("{}; refetching canonical state", e),
            }
        }
        self.cache.remove(CacheKind::HostSession, &id);
    }

    async fn refetch(&self) -> SessionSnapshot {
        self.cache
            .remove(CacheKind::HostSession, &self.cache_id());
        self.snapshot().await
    }
}

/// Host/counterpart actions observed on the push channel. A counterpart
/// opt-in is deliberately NOT modeled here: the `host_opt_in` event does not
/// say which participant acted, so the engine invalidates the snapshot and
/// refetches rather than guessing.
#[derive(Debug, Clone, Copy)]
pub enum RemoteTransition {
    Handoff,
    Exited,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_session() -> HostSession {
        HostSession {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            participant_a_id: Uuid::new_v4(),
            participant_b_id: Uuid::new_v4(),
            participant_a_opted_in: false,
            participant_b_opted_in: false,
            status: SessionStatus::Pending,
        }
    }

    #[test]
    fn test_opt_in_is_idempotent() {
        let mut session = pending_session();

        assert_eq!(apply_opt_in(&mut session, ParticipantRole::ParticipantA), Ok(false));
        assert!(session.participant_a_opted_in);
        assert_eq!(session.status, SessionStatus::Pending);

        // Second call: no duplicate transition, no flag churn.
        assert_eq!(apply_opt_in(&mut session, ParticipantRole::ParticipantA), Ok(false));
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[test]
    fn test_both_opt_ins_activate_exactly_once() {
        let mut session = pending_session();

        apply_opt_in(&mut session, ParticipantRole::ParticipantA).unwrap();
        let activated = apply_opt_in(&mut session, ParticipantRole::ParticipantB).unwrap();

        assert!(activated);
        assert_eq!(session.status, SessionStatus::Active);

        // Opting in while active is a no-op, not a second activation.
        assert_eq!(apply_opt_in(&mut session, ParticipantRole::ParticipantA), Ok(false));
    }

    #[test]
    fn test_exit_requires_active_and_resets_flags() {
        let mut session = pending_session();
        assert!(apply_exit(&mut session).is_err());

        apply_opt_in(&mut session, ParticipantRole::ParticipantA).unwrap();
        apply_opt_in(&mut session, ParticipantRole::ParticipantB).unwrap();
        apply_exit(&mut session).unwrap();

        assert_eq!(session.status, SessionStatus::Exited);
        assert!(!session.participant_a_opted_in);
        assert!(!session.participant_b_opted_in);
    }

    #[test]
    fn test_reentry_from_exited() {
        let mut session = pending_session();
        apply_opt_in(&mut session, ParticipantRole::ParticipantA).unwrap();
        apply_opt_in(&mut session, ParticipantRole::ParticipantB).unwrap();
        apply_exit(&mut session).unwrap();

        apply_opt_in(&mut session, ParticipantRole::ParticipantB).unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.participant_b_opted_in);
        assert!(!session.participant_a_opted_in);
    }

    #[test]
    fn test_handoff_completes_and_is_terminal() {
        let mut session = pending_session();
        apply_opt_in(&mut session, ParticipantRole::ParticipantA).unwrap();
        apply_opt_in(&mut session, ParticipantRole::ParticipantB).unwrap();
        apply_handoff(&mut session).unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert!(apply_opt_in(&mut session, ParticipantRole::ParticipantA).is_err());
    }

    #[test]
    fn test_opt_out_clears_only_own_flag() {
        let mut session = pending_session();
        session.participant_a_opted_in = true;
        session.participant_b_opted_in = true;
        session.status = SessionStatus::Pending;

        apply_opt_out(&mut session, ParticipantRole::ParticipantA).unwrap();
        assert!(!session.participant_a_opted_in);
        assert!(session.participant_b_opted_in);
    }

    #[test]
    fn test_banner_shown_after_exit_until_reoptin() {
        let state = banner_state(Some(SessionStatus::Exited), false, false, true);
        assert!(state.visible());

        let state = banner_state(Some(SessionStatus::Exited), true, false, true);
        assert!(!state.visible());
    }

    #[test]
    fn test_banner_hidden_while_active_or_completed() {
        assert!(!banner_state(Some(SessionStatus::Active), true, true, true).visible());
        assert!(!banner_state(Some(SessionStatus::Completed), false, false, false).visible());
    }

    #[test]
    fn test_banner_for_fresh_conversation_only() {
        assert_eq!(banner_state(None, false, false, false), BannerState::Invite);
        assert_eq!(banner_state(None, false, false, true), BannerState::Hidden);
    }

    #[test]
    fn test_banner_reports_waiting_counterpart() {
        let state = banner_state(Some(SessionStatus::Pending), false, true, false);
        assert_eq!(state, BannerState::CounterpartWaiting);
    }
}
