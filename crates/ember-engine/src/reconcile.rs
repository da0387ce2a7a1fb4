use chrono::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use ember_store::messages::merge_append;
use ember_types::models::{ConversationLog, Message};

/// Heuristic match window: an incoming message within this many seconds of a
/// local copy with the same sender and content is treated as its echo.
const HEURISTIC_WINDOW_SECS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The incoming id was already stored; replaced in place.
    ReplacedById,
    /// Matched the optimistic copy through the server-supplied correlation id.
    ReplacedByCorrelation,
    /// Matched an optimistic copy by sender + content + time window.
    ReplacedByHeuristic,
    /// No local counterpart; stored as a new message.
    Appended,
}

/// Fold one server-delivered message (transport echo or fallback response)
/// into the log. Pure: no I/O, callers persist the log afterwards.
///
/// Match order: exact id, then correlation id, then the heuristic. The
/// heuristic can coalesce two genuinely distinct rapid identical messages
/// from one sender; that ambiguity is inherited from the product behavior
/// and deliberately not "fixed" here — a correlation id wins whenever the
/// server supplies one.
pub fn reconcile_incoming(
    log: &mut ConversationLog,
    mut incoming: Message,
    correlation_id: Option<Uuid>,
    bound: usize,
) -> ReconcileOutcome {
    incoming.pending = false;

    // Exact server id: last writer wins, in place.
    if let Some(idx) = log.messages.iter().position(|m| m.id == incoming.id) {
        log.messages[idx] = incoming;
        log.refresh_cursors();
        return ReconcileOutcome::ReplacedById;
    }

    // Correlation id maps straight back to the optimistic temp id.
    if let Some(correlation_id) = correlation_id {
        if let Some(idx) = log.messages.iter().position(|m| m.id == correlation_id) {
            replace_at(log, idx, incoming, bound);
            return ReconcileOutcome::ReplacedByCorrelation;
        }
    }

    // Heuristic: same sender, same content, close in time.
    if let Some(idx) = heuristic_match(log, &incoming) {
        replace_at(log, idx, incoming, bound);
        return ReconcileOutcome::ReplacedByHeuristic;
    }

    merge_append(log, incoming, bound);
    ReconcileOutcome::Appended
}

/// Swap a local entry for its server version. The server timestamp may
/// differ from the optimistic one, so the replacement is re-inserted in
/// chronological position rather than overwritten in place.
fn replace_at(log: &mut ConversationLog, idx: usize, incoming: Message, bound: usize) {
    let local = log.messages.remove(idx);
    debug!(
        "reconciled local message {} into server message {}",
        local.id, incoming.id
    );
    merge_append(log, incoming, bound);
}

fn heuristic_match(log: &ConversationLog, incoming: &Message) -> Option<usize> {
    let window = Duration::seconds(HEURISTIC_WINDOW_SECS);

    let candidates: Vec<usize> = log
        .messages
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            m.sender_id == incoming.sender_id
                && m.content == incoming.content
                && (m.created_at - incoming.created_at).abs() < window
        })
        .map(|(idx, _)| idx)
        .collect();

    if candidates.len() > 1 {
        warn!(
            "ambiguous reconciliation in conversation {}: {} candidates for incoming {}",
            log.conversation_id,
            candidates.len(),
            incoming.id
        );
    }

    // Prefer a pending optimistic copy; among several, the closest timestamp.
    candidates
        .into_iter()
        .min_by_key(|&idx| {
            let m = &log.messages[idx];
            let dt = (m.created_at - incoming.created_at)
                .abs()
                .num_milliseconds();
            (!m.pending, dt)
        })
}
