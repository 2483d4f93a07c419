//! Durable cache of the last authenticated wallet address
//!
//! The cached value is advisory: it is never trusted without checking it
//! against the live wallet and the provider session. Writes happen only
//! while the session and the wallet agree, and the value is cleared on
//! every teardown.
//!
//! Both caches also implement [`SessionStore`], holding the provider session
//! under a second key so a restarted agent can recover it.
//!
//! Backend failures are logged and swallowed (graceful degradation), so a
//! cache outage never blocks authentication.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::session::{Session, SessionStore};

/// Suffix of the key holding the persisted provider session
const SESSION_KEY_SUFFIX: &str = ":session";

/// Storage for the last authenticated wallet address
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Last stored address, if any
    async fn load(&self) -> Option<String>;

    async fn store(&self, address: &str);

    async fn clear(&self);
}

/// Redis-backed cache
///
/// The address lives under `key`, the provider session as JSON under
/// `{key}:session`. Both share the same TTL.
#[derive(Clone)]
pub struct RedisSessionCache {
    redis: ConnectionManager,
    key: String,
    session_key: String,
    ttl: Duration,
}

impl RedisSessionCache {
    pub fn new(redis: ConnectionManager, key: impl Into<String>, ttl: Duration) -> Self {
        let key = key.into();
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Initializing session cache");
        Self {
            session_key: format!("{}{}", key, SESSION_KEY_SUFFIX),
            redis,
            key,
            ttl,
        }
    }
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn load(&self) -> Option<String> {
        let mut conn = self.redis.clone();

        match conn.get::<_, Option<String>>(&self.key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Session cache read failed");
                None
            }
        }
    }

    async fn store(&self, address: &str) {
        let mut conn = self.redis.clone();

        if let Err(e) = conn
            .set_ex::<_, _, ()>(&self.key, address, self.ttl.as_secs())
            .await
        {
            warn!(key = %self.key, error = %e, "Session cache write failed");
        }
    }

    async fn clear(&self) {
        let mut conn = self.redis.clone();

        if let Err(e) = conn.del::<_, ()>(&self.key).await {
            warn!(key = %self.key, error = %e, "Session cache delete failed");
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionCache {
    async fn load_session(&self) -> Option<Session> {
        let mut conn = self.redis.clone();

        let raw = match conn.get::<_, Option<String>>(&self.session_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %self.session_key, error = %e, "Session store read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(key = %self.session_key, error = %e, "Discarding unreadable persisted session");
                None
            }
        }
    }

    async fn store_session(&self, session: &Session) {
        let raw = match serde_json::to_string(session) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to encode session");
                return;
            }
        };

        let mut conn = self.redis.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&self.session_key, raw, self.ttl.as_secs())
            .await
        {
            warn!(key = %self.session_key, error = %e, "Session store write failed");
        }
    }

    async fn clear_session(&self) {
        let mut conn = self.redis.clone();

        if let Err(e) = conn.del::<_, ()>(&self.session_key).await {
            warn!(key = %self.session_key, error = %e, "Session store delete failed");
        }
    }
}

/// Process-local cache, for tests and ephemeral agents
#[derive(Debug, Default)]
pub struct MemorySessionCache {
    value: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously stored address
    pub fn with_value(address: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(address.into())),
            session: Mutex::default(),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        lock(&self.value)
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn load(&self) -> Option<String> {
        self.slot().clone()
    }

    async fn store(&self, address: &str) {
        *self.slot() = Some(address.to_string());
    }

    async fn clear(&self) {
        *self.slot() = None;
    }
}

#[async_trait]
impl SessionStore for MemorySessionCache {
    async fn load_session(&self) -> Option<Session> {
        lock(&self.session).clone()
    }

    async fn store_session(&self, session: &Session) {
        *lock(&self.session) = Some(session.clone());
    }

    async fn clear_session(&self) {
        *lock(&self.session) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
