use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_backend::{BackendClient, BackendError};
use ember_store::cache::{CacheKind, ResponseCache};
use ember_store::messages::LocalMessageStore;
use ember_store::Database;
use ember_transport::dispatcher::{Subscription, SubscriptionFilter};
use ember_transport::Connection;
use ember_types::api::SendMessageRequest;
use ember_types::error::TransportError;
use ember_types::events::{ChannelCommand, ChannelEvent};
use ember_types::models::{ConversationLog, HostMessage, Message};

use crate::config::EngineConfig;
use crate::host::{BannerState, HostSessionHandle, RemoteTransition};
use crate::reconcile::reconcile_incoming;

/// Failures surfaced to the UI for retry. Only user-initiated actions reach
/// this type; infrastructure trouble (socket drops, storage hiccups) is
/// recovered internally and at most logged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Notifications pushed to conversation watchers.
#[derive(Debug, Clone)]
pub enum EngineUpdate {
    /// The local log changed; reload via [`SyncEngine::conversation`].
    MessagesUpdated { conversation_id: Uuid },
    /// The assisted-session snapshot changed.
    HostSessionChanged { conversation_id: Uuid },
    /// A message arrived inside the assisted session.
    HostMessage {
        conversation_id: Uuid,
        message: HostMessage,
    },
}

struct OpenConversation {
    subscription_id: Uuid,
    pump: JoinHandle<()>,
    watchers: Vec<mpsc::UnboundedSender<EngineUpdate>>,
}

struct EngineInner {
    config: EngineConfig,
    user_id: Uuid,
    credential: String,
    store: LocalMessageStore,
    cache: ResponseCache,
    transport: Connection,
    backend: BackendClient,
    /// Per-conversation mutation locks: the optimistic-send and echo paths
    /// race on the same log, so read-modify-write cycles are serialized.
    conv_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Publishes awaiting their echo, keyed by correlation id.
    pending_echo: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    open: Mutex<HashMap<Uuid, OpenConversation>>,
}

/// One engine instance per authenticated session. All open conversations
/// multiplex over the single transport connection; the store and cache share
/// one persisted namespace.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        user_id: Uuid,
        credential: impl Into<String>,
    ) -> Result<Self> {
        let db = Arc::new(match &config.db_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        });
        let credential = credential.into();

        let store = LocalMessageStore::new(db.clone(), config.message_bound);
        let cache = ResponseCache::new(db);
        let transport = Connection::new(config.transport.clone());
        let backend = BackendClient::new(config.api_url.clone(), credential.clone());

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                user_id,
                credential,
                store,
                cache,
                transport,
                backend,
                conv_locks: Mutex::new(HashMap::new()),
                pending_echo: Mutex::new(HashMap::new()),
                open: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.inner.user_id
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.inner.transport.connect(&self.inner.credential).await
    }

    /// Tear down the session: transport closed, caches and logs purged.
    pub async fn logout(&self) {
        let open_ids: Vec<Uuid> = self.inner.open.lock().await.keys().copied().collect();
        for conversation_id in open_ids {
            self.close_conversation(conversation_id).await;
        }
        self.inner.transport.disconnect().await;
        self.inner.cache.invalidate_all();
        if let Err(e) = self.inner.store.clear_all() {
            warn!("failed to purge conversation logs on logout: {}", e);
        }
        info!("engine logged out");
    }

    /// Current local view of a conversation.
    pub fn conversation(&self, conversation_id: Uuid) -> Option<ConversationLog> {
        self.inner.store.load(conversation_id)
    }

    /// Open a conversation: join its room, start the event pump, cold-load
    /// from the backend if the local snapshot is stale, and hand back an
    /// update channel. Transport or backend trouble here degrades to the
    /// local log; it never fails the open.
    pub async fn open_conversation(
        &self,
        conversation_id: Uuid,
    ) -> mpsc::UnboundedReceiver<EngineUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Register the watcher and pump first: the room join below can spend
        // a whole reconnect budget dialing, and the open map must not stay
        // locked for that long or every pump's fan-out stalls behind it.
        let sub = self
            .inner
            .transport
            .subscribe(SubscriptionFilter::room(conversation_id))
            .await;
        let spare_subscription = {
            let mut open = self.inner.open.lock().await;
            if let Some(oc) = open.get_mut(&conversation_id) {
                oc.watchers.push(tx);
                Some(sub.id)
            } else {
                let subscription_id = sub.id;
                let pump = tokio::spawn(run_pump(self.inner.clone(), conversation_id, sub));
                open.insert(
                    conversation_id,
                    OpenConversation {
                        subscription_id,
                        pump,
                        watchers: vec![tx],
                    },
                );
                None
            }
        };

        match spare_subscription {
            // Already open: the pre-made subscription is surplus.
            Some(id) => self.inner.transport.unsubscribe(id).await,
            None => {
                if let Err(e) = self.inner.transport.join_room(conversation_id).await {
                    warn!(
                        "room join failed for {} ({}); serving local + fallback",
                        conversation_id, e
                    );
                }
            }
        }

        self.refresh_if_stale(conversation_id).await;
        rx
    }

    /// Close a conversation: leave the room (silencing its subscribers),
    /// stop the pump, drop the watchers.
    pub async fn close_conversation(&self, conversation_id: Uuid) {
        let removed = self.inner.open.lock().await.remove(&conversation_id);
        if let Some(oc) = removed {
            self.inner.transport.unsubscribe(oc.subscription_id).await;
            oc.pump.abort();
        }
        self.inner.transport.leave_room(conversation_id).await;
    }

    /// Optimistic send. The message lands in the local log immediately; the
    /// publish is fire-and-forget and the echo is the acknowledgment. If no
    /// echo arrives within the fallback timeout (or the link is down), the
    /// HTTP path delivers and its response is reconciled instead.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        content: impl Into<String>,
    ) -> Result<Message, EngineError> {
        let content = content.into();
        let mut optimistic = Message::text(conversation_id, self.inner.user_id, content.clone());
        optimistic.pending = true;
        let correlation_id = optimistic.id;

        {
            let lock = conv_lock(&self.inner, conversation_id).await;
            let _guard = lock.lock().await;
            if let Err(e) = self.inner.store.append(conversation_id, optimistic) {
                warn!("optimistic append failed: {}", e);
            }
        }
        notify(
            &self.inner,
            conversation_id,
            EngineUpdate::MessagesUpdated { conversation_id },
        )
        .await;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_echo
            .lock()
            .await
            .insert(correlation_id, tx);

        let published = self
            .inner
            .transport
            .publish(ChannelCommand::SendMessage {
                conversation_id,
                content: content.clone(),
                correlation_id,
            })
            .await
            .is_ok();

        if published {
            match tokio::time::timeout(self.inner.config.fallback_timeout, rx).await {
                Ok(Ok(echo)) => return Ok(echo),
                _ => debug!(
                    "no echo for {} within {:?}, falling back to HTTP",
                    correlation_id, self.inner.config.fallback_timeout
                ),
            }
        }
        self.inner.pending_echo.lock().await.remove(&correlation_id);

        let request = SendMessageRequest::text(content, correlation_id);
        let server = self
            .inner
            .backend
            .send_message(conversation_id, &request)
            .await?;

        // The fallback response may arrive after the conversation was
        // closed; never mutate a log nobody is watching anymore.
        if self.is_open(conversation_id).await {
            let lock = conv_lock(&self.inner, conversation_id).await;
            let _guard = lock.lock().await;
            let mut log = self
                .inner
                .store
                .load(conversation_id)
                .unwrap_or_else(|| ConversationLog::empty(conversation_id));
            reconcile_incoming(
                &mut log,
                server.clone(),
                Some(correlation_id),
                self.inner.store.bound(),
            );
            if let Err(e) = self.inner.store.persist(&log) {
                warn!("failed to persist fallback result: {}", e);
            }
            drop(_guard);
            notify(
                &self.inner,
                conversation_id,
                EngineUpdate::MessagesUpdated { conversation_id },
            )
            .await;
        }

        Ok(server)
    }

    /// Backward pagination from the oldest retained cursor. User-initiated,
    /// so backend failures surface for retry.
    pub async fn load_older(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<ConversationLog>, EngineError> {
        let cursor = self
            .inner
            .store
            .load(conversation_id)
            .and_then(|log| log.oldest_id);
        let Some(before) = cursor else {
            return Ok(self.inner.store.load(conversation_id));
        };

        let page = self
            .inner
            .backend
            .get_messages_before(conversation_id, before)
            .await?;

        if !self.is_open(conversation_id).await {
            // Closed while the page was in flight.
            return Ok(self.inner.store.load(conversation_id));
        }

        let lock = conv_lock(&self.inner, conversation_id).await;
        let _guard = lock.lock().await;
        let log = match self.inner.store.prepend_older(conversation_id, page.messages) {
            Ok(log) => log,
            Err(e) => {
                warn!("pagination merge failed: {}", e);
                return Ok(self.inner.store.load(conversation_id));
            }
        };
        drop(_guard);

        notify(
            &self.inner,
            conversation_id,
            EngineUpdate::MessagesUpdated { conversation_id },
        )
        .await;
        Ok(Some(log))
    }

    /// User-initiated refresh (pull to refresh): bypass the snapshot TTL.
    pub async fn refresh(&self, conversation_id: Uuid) -> Result<(), EngineError> {
        cold_load(&self.inner, conversation_id).await?;
        Ok(())
    }

    /// Unmatch: drop everything local for the conversation and invalidate
    /// the match-derived cache groups.
    pub async fn clear_conversation(&self, conversation_id: Uuid) {
        self.close_conversation(conversation_id).await;
        if let Err(e) = self.inner.store.clear(conversation_id) {
            warn!("failed to clear conversation {}: {}", conversation_id, e);
        }
        let id = conversation_id.to_string();
        self.inner.cache.remove(CacheKind::Conversation, &id);
        self.inner.cache.remove(CacheKind::HostSession, &id);
        self.inner.cache.invalidate(CacheKind::Matches);
    }

    /// Handle to the conversation's assisted-session state.
    pub fn host_session(&self, conversation_id: Uuid) -> HostSessionHandle {
        host_handle(&self.inner, conversation_id)
    }

    /// Opt-in banner visibility for a conversation, fail-closed when the
    /// session state cannot be fetched.
    pub async fn banner(&self, conversation_id: Uuid) -> BannerState {
        let has_user_messages = self
            .inner
            .store
            .load(conversation_id)
            .map_or(false, |log| !log.messages.is_empty());
        self.host_session(conversation_id)
            .banner(has_user_messages)
            .await
    }

    async fn is_open(&self, conversation_id: Uuid) -> bool {
        self.inner.open.lock().await.contains_key(&conversation_id)
    }

    async fn refresh_if_stale(&self, conversation_id: Uuid) {
        let fresh = self
            .inner
            .cache
            .get::<bool>(
                CacheKind::Conversation,
                &conversation_id.to_string(),
                self.inner.config.ttl.conversation,
            )
            .is_some();
        if fresh {
            return;
        }
        if let Err(e) = cold_load(&self.inner, conversation_id).await {
            warn!(
                "cold load failed for {} ({}); serving local log",
                conversation_id, e
            );
        }
    }
}

fn host_handle(inner: &Arc<EngineInner>, conversation_id: Uuid) -> HostSessionHandle {
    HostSessionHandle::new(
        conversation_id,
        inner.user_id,
        inner.backend.clone(),
        inner.cache.clone(),
        inner.config.ttl.host_session,
    )
}

async fn conv_lock(inner: &EngineInner, conversation_id: Uuid) -> Arc<Mutex<()>> {
    inner
        .conv_locks
        .lock()
        .await
        .entry(conversation_id)
        .or_default()
        .clone()
}

async fn notify(inner: &EngineInner, conversation_id: Uuid, update: EngineUpdate) {
    let mut open = inner.open.lock().await;
    if let Some(oc) = open.get_mut(&conversation_id) {
        oc.watchers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

/// Authoritative reload of one conversation, stamping the snapshot marker.
async fn cold_load(inner: &Arc<EngineInner>, conversation_id: Uuid) -> Result<(), BackendError> {
    let response = inner.backend.get_conversation(conversation_id).await?;

    {
        let lock = conv_lock(inner, conversation_id).await;
        let _guard = lock.lock().await;
        if let Err(e) = inner.store.save_messages(conversation_id, response.messages) {
            warn!("failed to store cold load for {}: {}", conversation_id, e);
        }
    }
    inner
        .cache
        .set(CacheKind::Conversation, &conversation_id.to_string(), &true);

    notify(
        inner,
        conversation_id,
        EngineUpdate::MessagesUpdated { conversation_id },
    )
    .await;
    Ok(())
}

/// Per-conversation event pump: folds push-channel events into the store and
/// fans updates out to watchers. Lives as long as the conversation is open.
async fn run_pump(inner: Arc<EngineInner>, conversation_id: Uuid, mut sub: Subscription) {
    while let Some(event) = sub.events.recv().await {
        match event {
            ChannelEvent::NewMessage {
                message,
                correlation_id,
                ..
            } => {
                let outcome = {
                    let lock = conv_lock(&inner, conversation_id).await;
                    let _guard = lock.lock().await;
                    let mut log = inner
                        .store
                        .load(conversation_id)
                        .unwrap_or_else(|| ConversationLog::empty(conversation_id));
                    let outcome = reconcile_incoming(
                        &mut log,
                        message.clone(),
                        correlation_id,
                        inner.store.bound(),
                    );
                    if let Err(e) = inner.store.persist(&log) {
                        warn!("failed to persist incoming message: {}", e);
                    }
                    outcome
                };
                debug!("incoming {} reconciled: {:?}", message.id, outcome);

                if let Some(correlation_id) = correlation_id {
                    if let Some(tx) = inner.pending_echo.lock().await.remove(&correlation_id) {
                        let _ = tx.send(message);
                    }
                }
                notify(
                    &inner,
                    conversation_id,
                    EngineUpdate::MessagesUpdated { conversation_id },
                )
                .await;
            }
            ChannelEvent::HostOptIn { session_id, .. } => {
                // The event does not say which participant opted in; drop
                // the snapshot and let the next read fetch canonical state.
                debug!("host opt-in observed for session {}", session_id);
                inner
                    .cache
                    .remove(CacheKind::HostSession, &conversation_id.to_string());
                notify(
                    &inner,
                    conversation_id,
                    EngineUpdate::HostSessionChanged { conversation_id },
                )
                .await;
            }
            ChannelEvent::HostMessage { message, .. } => {
                notify(
                    &inner,
                    conversation_id,
                    EngineUpdate::HostMessage {
                        conversation_id,
                        message,
                    },
                )
                .await;
            }
            ChannelEvent::HostHandoff { .. } => {
                host_handle(&inner, conversation_id)
                    .apply_remote(RemoteTransition::Handoff)
                    .await;
                notify(
                    &inner,
                    conversation_id,
                    EngineUpdate::HostSessionChanged { conversation_id },
                )
                .await;
            }
            ChannelEvent::HostExited { .. } => {
                host_handle(&inner, conversation_id)
                    .apply_remote(RemoteTransition::Exited)
                    .await;
                notify(
                    &inner,
                    conversation_id,
                    EngineUpdate::HostSessionChanged { conversation_id },
                )
                .await;

                // Assisted history leaves the UI; reload the plain
                // conversation from the authoritative backend.
                inner
                    .cache
                    .remove(CacheKind::Conversation, &conversation_id.to_string());
                if let Err(e) = cold_load(&inner, conversation_id).await {
                    warn!(
                        "conversation reload after host exit failed for {}: {}",
                        conversation_id, e
                    );
                }
            }
        }
    }
}
