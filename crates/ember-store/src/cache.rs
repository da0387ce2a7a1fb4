use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::Database;

/// Logical cache groups. Each kind gets its own TTL (policy lives in the
/// engine config, not here) and can be invalidated as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Profile,
    Matches,
    Discovery,
    WhoLikedMe,
    Conversation,
    HostSession,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Matches => "matches",
            Self::Discovery => "discovery",
            Self::WhoLikedMe => "who-liked-me",
            Self::Conversation => "conversation",
            Self::HostSession => "host-session",
        }
    }
}

fn cache_key(kind: CacheKind, id: &str) -> String {
    format!("cache:{}:{}", kind.as_str(), id)
}

/// Generic TTL response cache over the record store. A miss is a miss:
/// expiry, absence, and storage failure all look the same to callers, and
/// an expired entry is evicted on the read that discovers it.
#[derive(Clone)]
pub struct ResponseCache {
    db: Arc<Database>,
}

impl ResponseCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get<T: DeserializeOwned>(&self, kind: CacheKind, id: &str, max_age: Duration) -> Option<T> {
        self.get_with_age(kind, id, max_age).map(|(payload, _)| payload)
    }

    /// Freshness check plus the entry's age, for stale-while-revalidate
    /// callers that refresh in the background when the age is high.
    pub fn get_with_age<T: DeserializeOwned>(
        &self,
        kind: CacheKind,
        id: &str,
        max_age: Duration,
    ) -> Option<(T, Duration)> {
        let key = cache_key(kind, id);
        let row = match self.db.get_record(&key) {
            Ok(row) => row?,
            Err(e) => {
                warn!("cache read failed for {}: {}", key, e);
                return None;
            }
        };

        let age = (Utc::now() - row.stored_at).to_std().unwrap_or_default();
        if age > max_age {
            let _ = self.db.delete_record(&key);
            return None;
        }

        match serde_json::from_str(&row.payload) {
            Ok(payload) => Some((payload, age)),
            Err(e) => {
                warn!("cache record corrupt for {}, dropping: {}", key, e);
                let _ = self.db.delete_record(&key);
                None
            }
        }
    }

    /// Overwrite unconditionally with a fresh `stored_at`.
    pub fn set<T: Serialize>(&self, kind: CacheKind, id: &str, payload: &T) {
        let key = cache_key(kind, id);
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!("cache serialize failed for {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.db.put_record(&key, &json, Utc::now()) {
            warn!("cache write failed for {}: {}", key, e);
        }
    }

    pub fn remove(&self, kind: CacheKind, id: &str) {
        let key = cache_key(kind, id);
        if let Err(e) = self.db.delete_record(&key) {
            warn!("cache delete failed for {}: {}", key, e);
        }
    }

    /// Remove every entry in one logical group. Returns how many were removed.
    pub fn invalidate(&self, kind: CacheKind) -> usize {
        let prefix = format!("cache:{}:", kind.as_str());
        match self.db.delete_prefix(&prefix) {
            Ok(n) => n,
            Err(e) => {
                warn!("cache invalidation failed for {}: {}", prefix, e);
                0
            }
        }
    }

    pub fn invalidate_all(&self) -> usize {
        match self.db.delete_prefix("cache:") {
            Ok(n) => n,
            Err(e) => {
                warn!("cache full invalidation failed: {}", e);
                0
            }
        }
    }
}
