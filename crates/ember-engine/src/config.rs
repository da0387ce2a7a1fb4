use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use ember_store::cache::CacheKind;
use ember_transport::TransportConfig;

/// Per-kind cache freshness windows. Values are policy, not mechanism: the
/// cache itself takes a max-age per call.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub profile: Duration,
    pub matches: Duration,
    pub discovery: Duration,
    pub who_liked_me: Duration,
    pub conversation: Duration,
    pub host_session: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            profile: Duration::from_secs(300),
            matches: Duration::from_secs(120),
            discovery: Duration::from_secs(60),
            who_liked_me: Duration::from_secs(120),
            conversation: Duration::from_secs(30),
            host_session: Duration::from_secs(10),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::Profile => self.profile,
            CacheKind::Matches => self.matches,
            CacheKind::Discovery => self.discovery,
            CacheKind::WhoLikedMe => self.who_liked_me,
            CacheKind::Conversation => self.conversation,
            CacheKind::HostSession => self.host_session,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_url: String,
    pub transport: TransportConfig,
    /// None keeps the store in memory (no persistence across restarts).
    pub db_path: Option<PathBuf>,
    /// Max retained messages per conversation.
    pub message_bound: usize,
    /// How long to wait for a publish echo before using the HTTP fallback.
    pub fallback_timeout: Duration,
    pub ttl: TtlPolicy,
}

impl EngineConfig {
    pub fn new(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            transport: TransportConfig::new(ws_url),
            db_path: None,
            message_bound: ember_store::messages::DEFAULT_BOUND,
            fallback_timeout: Duration::from_secs(5),
            ttl: TtlPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        // Load .env if present
        let _ = dotenvy::dotenv();

        let api_url = std::env::var("EMBER_API_URL")
            .unwrap_or_else(|_| "http://localhost:3000".into());
        let ws_url = std::env::var("EMBER_WS_URL")
            .unwrap_or_else(|_| "ws://localhost:3000/sync".into());

        let mut config = Self::new(api_url, ws_url);
        config.db_path = std::env::var("EMBER_DB_PATH").ok().map(PathBuf::from);
        if let Ok(bound) = std::env::var("EMBER_MESSAGE_BOUND") {
            config.message_bound = bound.parse()?;
        }
        if let Ok(ms) = std::env::var("EMBER_FALLBACK_TIMEOUT_MS") {
            config.fallback_timeout = Duration::from_millis(ms.parse()?);
        }
        Ok(config)
    }
}
