use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use ember_engine::{
    reconcile_incoming, BannerState, EngineConfig, EngineError, ReconcileOutcome, SyncEngine,
};
use ember_store::messages::LocalMessageStore;
use ember_store::Database;
use ember_types::models::Message;

fn unreachable_engine() -> SyncEngine {
    let mut config = EngineConfig::new("http://127.0.0.1:1", "ws://127.0.0.1:1/sync");
    config.fallback_timeout = Duration::from_millis(50);
    config.transport.max_attempts = 1;
    config.transport.backoff_base = Duration::from_millis(1);
    SyncEngine::new(config, Uuid::new_v4(), "test-token").unwrap()
}

#[test]
fn optimistic_send_then_echo_persists_one_message() {
    let store = LocalMessageStore::new(Arc::new(Database::open_in_memory().unwrap()), 100);
    let conversation = Uuid::new_v4();
    let user = Uuid::new_v4();

    let mut optimistic = Message::text(conversation, user, "hi");
    optimistic.pending = true;
    store.append(conversation, optimistic.clone()).unwrap();

    let mut echo = optimistic.clone();
    echo.id = Uuid::new_v4();
    echo.pending = false;
    echo.created_at = optimistic.created_at + chrono::Duration::seconds(2);

    let mut log = store.load(conversation).unwrap();
    let outcome = reconcile_incoming(&mut log, echo.clone(), Some(optimistic.id), 100);
    assert_eq!(outcome, ReconcileOutcome::ReplacedByCorrelation);
    store.persist(&log).unwrap();

    let log = store.load(conversation).unwrap();
    assert_eq!(log.messages.len(), 1);
    assert_eq!(log.messages[0].id, echo.id);
    assert!(!log.messages[0].pending);
    assert_eq!(log.newest_id, Some(echo.id));
}

#[test]
fn reconciled_log_survives_restart() {
    let path = std::env::temp_dir().join(format!("ember-sync-test-{}.db", Uuid::new_v4()));
    let conversation = Uuid::new_v4();
    let user = Uuid::new_v4();
    let server_id;

    {
        let store = LocalMessageStore::new(Arc::new(Database::open(&path).unwrap()), 100);
        let mut optimistic = Message::text(conversation, user, "see you there");
        optimistic.pending = true;
        store.append(conversation, optimistic.clone()).unwrap();

        let mut echo = optimistic.clone();
        echo.id = Uuid::new_v4();
        echo.pending = false;
        server_id = echo.id;

        let mut log = store.load(conversation).unwrap();
        reconcile_incoming(&mut log, echo, Some(optimistic.id), 100);
        store.persist(&log).unwrap();
    }

    // Fresh process: same file, same canonical log.
    let store = LocalMessageStore::new(Arc::new(Database::open(&path).unwrap()), 100);
    let log = store.load(conversation).unwrap();
    assert_eq!(log.messages.len(), 1);
    assert_eq!(log.messages[0].id, server_id);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn fallback_delivery_after_echo_is_idempotent() {
    // Both the echo and the HTTP fallback can deliver the same logical
    // message; whichever lands second must not duplicate it.
    let store = LocalMessageStore::new(Arc::new(Database::open_in_memory().unwrap()), 100);
    let conversation = Uuid::new_v4();
    let user = Uuid::new_v4();

    let mut optimistic = Message::text(conversation, user, "double tap");
    optimistic.pending = true;
    store.append(conversation, optimistic.clone()).unwrap();

    let mut server = optimistic.clone();
    server.id = Uuid::new_v4();
    server.pending = false;
    server.created_at = Utc::now();

    let mut log = store.load(conversation).unwrap();
    reconcile_incoming(&mut log, server.clone(), Some(optimistic.id), 100);
    let outcome = reconcile_incoming(&mut log, server.clone(), Some(optimistic.id), 100);
    store.persist(&log).unwrap();

    assert_eq!(outcome, ReconcileOutcome::ReplacedById);
    assert_eq!(store.load(conversation).unwrap().messages.len(), 1);
}

#[tokio::test]
async fn banner_fails_closed_when_backend_unreachable() {
    let engine = unreachable_engine();
    let banner = engine.banner(Uuid::new_v4()).await;
    assert_eq!(banner, BannerState::Hidden);
}

#[tokio::test]
async fn send_surfaces_failure_and_keeps_optimistic_copy() {
    let engine = unreachable_engine();
    let conversation = Uuid::new_v4();

    let result = engine.send_message(conversation, "hello?").await;
    assert!(matches!(result, Err(EngineError::Backend(_))));

    // The optimistic copy stays pending locally so the UI can retry.
    let log = engine.conversation(conversation).unwrap();
    assert_eq!(log.messages.len(), 1);
    assert!(log.messages[0].pending);
}

#[tokio::test]
async fn open_conversation_degrades_to_local_log() {
    let engine = unreachable_engine();
    let conversation = Uuid::new_v4();

    // Transport and backend are both down; opening still works off the
    // local (empty) log and a watcher channel is handed back.
    let rx = engine.open_conversation(conversation).await;
    assert!(engine.conversation(conversation).is_none());
    drop(rx);
    engine.close_conversation(conversation).await;
}

#[tokio::test]
async fn slow_room_join_does_not_stall_other_conversations() {
    let mut config = EngineConfig::new("http://127.0.0.1:1", "ws://127.0.0.1:1/sync");
    config.transport.max_attempts = 3;
    config.transport.backoff_base = Duration::from_millis(400);
    config.transport.backoff_cap = Duration::from_millis(400);
    let engine = SyncEngine::new(config, Uuid::new_v4(), "test-token").unwrap();

    // Stores the credential; the endpoint is down, so the room join below
    // redials through the whole backoff budget.
    let _ = engine.connect().await;

    let opener = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.open_conversation(Uuid::new_v4()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // While that open is dialing, other conversations must stay usable.
    tokio::time::timeout(
        Duration::from_millis(100),
        engine.close_conversation(Uuid::new_v4()),
    )
    .await
    .expect("conversation map stayed locked during a slow room join");

    drop(opener.await.unwrap());
}
