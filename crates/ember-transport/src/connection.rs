use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, trace, warn};
use url::Url;
use uuid::Uuid;

use ember_types::error::TransportError;
use ember_types::events::{ChannelCommand, ChannelEvent};

use crate::dispatcher::{Dispatcher, Subscription, SubscriptionFilter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Heartbeat: a Ping goes out every interval; two consecutive missed Pongs
/// drop the link and start the reconnect budget.
const MISSED_PONG_LIMIT: u8 = 2;

/// Connection policy. The backoff curve and budget are policy parameters,
/// not part of the transport contract.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: String,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_attempts: 6,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Exponential backoff: base doubled per attempt, capped.
pub fn backoff_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .backoff_base
        .checked_mul(factor)
        .map_or(config.backoff_cap, |d| d.min(config.backoff_cap))
}

struct Link {
    id: Uuid,
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    task: JoinHandle<()>,
}

struct ConnState {
    credential: Option<String>,
    link: Option<Link>,
    /// Bumped by `disconnect`. An in-flight connect re-reads it before
    /// installing a link so a teardown issued mid-dial is not undone.
    epoch: u64,
}

struct ConnectionInner {
    config: TransportConfig,
    dispatcher: Dispatcher,
    rooms: RwLock<HashSet<Uuid>>,
    state: Mutex<ConnState>,
    /// Serializes dial loops. Held instead of `state` while dialing so
    /// publishes and lifecycle calls never queue behind the backoff.
    connect_lock: Mutex<()>,
}

/// One authenticated, multiplexed push connection. Explicitly constructed
/// and injectable — tests and callers own the lifecycle, there is no global
/// instance. Publishes are fire-and-forget: the echo event is the only
/// acknowledgment, and a dropped link silently discards anything in flight.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                dispatcher: Dispatcher::new(),
                rooms: RwLock::new(HashSet::new()),
                state: Mutex::new(ConnState {
                    credential: None,
                    link: None,
                    epoch: 0,
                }),
                connect_lock: Mutex::new(()),
            }),
        }
    }

    /// Connect with the given credential. Idempotent: a no-op while the link
    /// is already up. Fails with `AuthRejected` on a bad credential, or
    /// `Unreachable` once the bounded backoff budget is spent.
    pub async fn connect(&self, credential: &str) -> Result<(), TransportError> {
        // One dial loop at a time. The state lock is only taken for short
        // sections; it is never held across a dial or a backoff sleep.
        let _dialing = self.inner.connect_lock.lock().await;

        let epoch = {
            let mut state = self.inner.state.lock().await;
            state.credential = Some(credential.to_string());
            if let Some(link) = &state.link {
                if !link.task.is_finished() {
                    return Ok(());
                }
            }
            state.epoch
        };

        let config = &self.inner.config;
        let mut last_failure = String::new();
        for attempt in 0..config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(config, attempt - 1)).await;
            }
            match dial(&config.endpoint, credential).await {
                Ok(ws) => {
                    let mut state = self.inner.state.lock().await;
                    if state.epoch != epoch {
                        // disconnect() ran while we were dialing; the later
                        // call wins and the fresh socket is dropped.
                        info!("connect superseded by disconnect");
                        return Ok(());
                    }
                    let link_id = Uuid::new_v4();
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    let task = tokio::spawn(run_link(self.inner.clone(), link_id, ws, cmd_rx));
                    state.link = Some(Link {
                        id: link_id,
                        cmd_tx,
                        task,
                    });
                    info!("push link established to {}", config.endpoint);
                    return Ok(());
                }
                Err(DialError::Auth) => return Err(TransportError::AuthRejected),
                Err(DialError::Other(e)) => {
                    warn!("connect attempt {} failed: {}", attempt + 1, e);
                    last_failure = e;
                }
            }
        }
        warn!("push endpoint unreachable: {}", last_failure);
        Err(TransportError::Unreachable {
            attempts: config.max_attempts,
        })
    }

    /// Tear the link down. In-flight unacknowledged publishes are dropped;
    /// subscriptions stay registered and resume on the next connect.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.epoch = state.epoch.wrapping_add(1);
        if let Some(link) = state.link.take() {
            link.task.abort();
            info!("push link closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.inner.state.lock().await;
        state
            .link
            .as_ref()
            .map_or(false, |link| !link.task.is_finished())
    }

    /// Join a room, implicitly connecting first with the stored credential.
    pub async fn join_room(&self, room_id: Uuid) -> Result<(), TransportError> {
        let needs_connect = {
            let state = self.inner.state.lock().await;
            match &state.link {
                Some(link) => link.task.is_finished(),
                None => true,
            }
        };
        if needs_connect {
            let credential = {
                let state = self.inner.state.lock().await;
                state.credential.clone().ok_or(TransportError::NotConnected)?
            };
            self.connect(&credential).await?;
        }

        self.inner.rooms.write().await.insert(room_id);
        self.publish(ChannelCommand::JoinRoom { room_id }).await
    }

    /// Leave a room. Delivery to this room's subscribers stops immediately,
    /// even if the server keeps emitting for a beat.
    pub async fn leave_room(&self, room_id: Uuid) {
        self.inner.rooms.write().await.remove(&room_id);
        // Best-effort notify; the local room set is what gates delivery.
        let _ = self.publish(ChannelCommand::LeaveRoom { room_id }).await;
    }

    pub async fn is_joined(&self, room_id: Uuid) -> bool {
        self.inner.rooms.read().await.contains(&room_id)
    }

    /// Fire-and-forget publish. Callers that need confirmation wait for the
    /// corresponding echo event within a timeout they define, then fall back
    /// to the HTTP path.
    pub async fn publish(&self, command: ChannelCommand) -> Result<(), TransportError> {
        let state = self.inner.state.lock().await;
        match &state.link {
            Some(link) if !link.task.is_finished() => link
                .cmd_tx
                .send(command)
                .map_err(|_| TransportError::NotConnected),
            _ => Err(TransportError::NotConnected),
        }
    }

    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.inner.dispatcher.subscribe(filter).await
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.inner.dispatcher.unsubscribe(id).await
    }
}

enum DialError {
    Auth,
    Other(String),
}

async fn dial(endpoint: &str, credential: &str) -> Result<WsStream, DialError> {
    let mut url = Url::parse(endpoint).map_err(|e| DialError::Other(e.to_string()))?;
    url.query_pairs_mut().append_pair("token", credential);

    match connect_async(url.as_str()).await {
        Ok((ws, _response)) => Ok(ws),
        Err(tokio_tungstenite::tungstenite::Error::Http(response))
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            Err(DialError::Auth)
        }
        Err(e) => Err(DialError::Other(e.to_string())),
    }
}

/// Link task: pumps outbound commands and inbound events over one socket,
/// heartbeats, and reconnects with the bounded backoff budget when the
/// socket drops. Room-gating happens here so that `leave_room` silences a
/// room without waiting on the server.
async fn run_link(
    inner: Arc<ConnectionInner>,
    link_id: Uuid,
    mut ws: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
) {
    loop {
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut pong_received = true;
        let mut missed: u8 = 0;
        let mut drop_reason = "stream ended";

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Connection handle dropped; nothing left to pump.
                        return;
                    };
                    let text = match serde_json::to_string(&cmd) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("unserializable command dropped: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        drop_reason = "send failed";
                        break;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_inbound(&inner, &text).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                drop_reason = "send failed";
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pong_received = true;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            drop_reason = "closed by server";
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("push link read error: {}", e);
                            drop_reason = "read error";
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_received {
                        missed = 0;
                    } else {
                        missed += 1;
                        if missed >= MISSED_PONG_LIMIT {
                            drop_reason = "heartbeat timeout";
                            break;
                        }
                    }
                    pong_received = false;
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        drop_reason = "send failed";
                        break;
                    }
                }
            }
        }

        // Anything published but not yet echoed is gone with the socket;
        // callers time out waiting for the echo and use the HTTP fallback.
        warn!("push link lost ({}), reconnecting", drop_reason);

        match redial(&inner).await {
            Some(new_ws) => ws = new_ws,
            None => break,
        }
    }

    // Only clear state if this task still owns the link; a newer connect()
    // may have taken over already.
    let mut state = inner.state.lock().await;
    if state.link.as_ref().map(|link| link.id) == Some(link_id) {
        state.link = None;
    }
    warn!("push link down; reconnect budget exhausted");
}

async fn handle_inbound(inner: &ConnectionInner, text: &str) {
    let event: ChannelEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("bad push event: {} -- raw: {}", e, log_snippet(text));
            return;
        }
    };

    if !inner.rooms.read().await.contains(&event.room_id()) {
        trace!("dropping event for room {} (not joined)", event.room_id());
        return;
    }

    inner.dispatcher.deliver(&event).await;
}

/// Clamp a raw frame for logging, backing up to a character boundary so a
/// multibyte frame cannot panic the slice.
fn log_snippet(text: &str) -> &str {
    const LIMIT: usize = 200;
    if text.len() <= LIMIT {
        return text;
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Bounded reconnect. On success the current room set is rejoined so that
/// subscriptions (which survived the drop) resume receiving.
async fn redial(inner: &ConnectionInner) -> Option<WsStream> {
    let credential = inner.state.lock().await.credential.clone()?;
    let config = &inner.config;

    for attempt in 0..config.max_attempts {
        tokio::time::sleep(backoff_delay(config, attempt)).await;
        match dial(&config.endpoint, &credential).await {
            Ok(mut ws) => {
                let rooms: Vec<Uuid> = inner.rooms.read().await.iter().copied().collect();
                for room_id in rooms {
                    let join = ChannelCommand::JoinRoom { room_id };
                    let text = match serde_json::to_string(&join) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if ws.send(Message::Text(text)).await.is_err() {
                        warn!("rejoin failed on reconnect attempt {}", attempt + 1);
                        break;
                    }
                }
                info!("push link re-established after {} attempts", attempt + 1);
                return Some(ws);
            }
            Err(DialError::Auth) => {
                warn!("credential rejected during reconnect, giving up");
                return None;
            }
            Err(DialError::Other(e)) => {
                warn!("reconnect attempt {} failed: {}", attempt + 1, e);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = TransportConfig::new("wss://example.test/sync");
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 63), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_publish_without_link_is_not_connected() {
        let connection = Connection::new(TransportConfig::new("wss://example.test/sync"));
        let result = connection
            .publish(ChannelCommand::LeaveRoom {
                room_id: Uuid::new_v4(),
            })
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_join_room_without_credential_is_not_connected() {
        let connection = Connection::new(TransportConfig::new("wss://example.test/sync"));
        let result = connection.join_room(Uuid::new_v4()).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_leave_room_clears_membership() {
        let connection = Connection::new(TransportConfig::new("wss://example.test/sync"));
        let room = Uuid::new_v4();
        connection.inner.rooms.write().await.insert(room);
        assert!(connection.is_joined(room).await);

        connection.leave_room(room).await;
        assert!(!connection.is_joined(room).await);
    }

    #[tokio::test]
    async fn test_subscriptions_are_independent_of_link_state() {
        let connection = Connection::new(TransportConfig::new("wss://example.test/sync"));
        let room = Uuid::new_v4();
        connection.inner.rooms.write().await.insert(room);

        let mut sub = connection.subscribe(SubscriptionFilter::room(room)).await;

        // No link up, but delivery through the dispatcher still works: the
        // registry outlives connects and disconnects.
        let event = ChannelEvent::HostExited { room_id: room };
        handle_inbound(&connection.inner, &serde_json::to_string(&event).unwrap()).await;
        assert!(sub.events.recv().await.is_some());
    }

    #[test]
    fn test_log_snippet_never_splits_a_character() {
        let text = "\u{20ac}".repeat(100); // 300 bytes, boundaries every 3
        let snippet = log_snippet(&text);
        assert!(snippet.len() <= 200);
        assert_eq!(snippet.len() % 3, 0);
        assert!(text.starts_with(snippet));

        assert_eq!(log_snippet("short"), "short");
    }

    #[tokio::test]
    async fn test_malformed_multibyte_frame_is_dropped() {
        // An active subscriber makes the warn branch format the raw frame.
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .try_init();

        let connection = Connection::new(TransportConfig::new("wss://example.test/sync"));
        let room = Uuid::new_v4();
        connection.inner.rooms.write().await.insert(room);
        let mut sub = connection.subscribe(SubscriptionFilter::room(room)).await;

        handle_inbound(&connection.inner, &"\u{20ac}".repeat(100)).await;
        assert!(sub.events.try_recv().is_err());

        // A bad frame never takes delivery down with it.
        let event = ChannelEvent::HostExited { room_id: room };
        handle_inbound(&connection.inner, &serde_json::to_string(&event).unwrap()).await;
        assert!(sub.events.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_connect_backoff_does_not_block_state_queries() {
        let mut config = TransportConfig::new("ws://127.0.0.1:1/sync");
        config.max_attempts = 3;
        config.backoff_base = Duration::from_millis(400);
        config.backoff_cap = Duration::from_millis(400);
        let connection = Connection::new(config);

        let dialing = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.connect("token").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The dial loop is sleeping between attempts; state readers and
        // publishes must not queue behind it.
        let connected = tokio::time::timeout(Duration::from_millis(100), connection.is_connected())
            .await
            .expect("is_connected blocked behind an in-flight connect");
        assert!(!connected);

        let published = tokio::time::timeout(
            Duration::from_millis(100),
            connection.publish(ChannelCommand::LeaveRoom {
                room_id: Uuid::new_v4(),
            }),
        )
        .await
        .expect("publish blocked behind an in-flight connect");
        assert!(matches!(published, Err(TransportError::NotConnected)));

        assert!(matches!(
            dialing.await.unwrap(),
            Err(TransportError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_inbound_for_unjoined_room_is_dropped() {
        let connection = Connection::new(TransportConfig::new("wss://example.test/sync"));
        let room = Uuid::new_v4();
        let mut sub = connection.subscribe(SubscriptionFilter::room(room)).await;

        let event = ChannelEvent::HostExited { room_id: room };
        handle_inbound(&connection.inner, &serde_json::to_string(&event).unwrap()).await;
        assert!(sub.events.try_recv().is_err());
    }
}
