//! Best-effort cache for resolved entitlement views
//!
//! The cache is an optimization only. [`CacheLayer`] bounds every call with a
//! timeout and turns any error into a miss, so callers always fall through to
//! the store.
//!
//! Invalidation replaces a per-identity generation marker instead of only
//! deleting the view. Views are written under the generation observed before
//! the store was read, so a slow resolve that loses a race with an
//! invalidation writes an entry that is never served.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chatmeter_shared::{SubscriptionTier, UserIdentity};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entitlement::EntitlementSource;
use crate::error::{BillingError, BillingResult};

/// Default TTL for cached views
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Longest TTL any entry is stored with
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default upper bound on a single cache round trip
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Raw key-value backend
#[async_trait]
pub trait EntitlementCache: Send + Sync {
    async fn get(&self, key: &str) -> BillingResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BillingResult<()>;

    async fn delete(&self, key: &str) -> BillingResult<()>;
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Process-local TTL map
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries
    pub async fn cleanup(&self) {
        self.entries.write().await.retain(|_, e| !e.is_expired());
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }
}

#[async_trait]
impl EntitlementCache for InMemoryCache {
    async fn get(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BillingResult<()> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(MAX_CACHE_TTL))
            .unwrap_or(now);

        self.entries
            .write()
            .await
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> BillingResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

// =============================================================================
// Redis backend
// =============================================================================

/// Redis backend over a multiplexed connection manager
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    /// Shared connection, for other Redis-backed services
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl EntitlementCache for RedisCache {
    async fn get(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.min(MAX_CACHE_TTL).as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

// =============================================================================
// Entitlement view
// =============================================================================

/// The part of a snapshot that is safe to cache. Counters are never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntitlement {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub is_paid: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_expiry: Option<OffsetDateTime>,
    pub source: EntitlementSource,
}

impl CachedEntitlement {
    /// A paid view whose expiry has passed (or is missing) must go back to
    /// the store so the demotion is persisted
    pub fn is_current(&self, now: OffsetDateTime) -> bool {
        if !self.is_paid {
            return true;
        }
        matches!(self.subscription_expiry, Some(expiry) if expiry > now)
    }
}

pub fn cache_key(identity: &UserIdentity) -> String {
    format!("entitlement:{}", identity)
}

pub fn generation_key(identity: &UserIdentity) -> String {
    format!("entitlement-gen:{}", identity)
}

/// Generation observed before a store read. Only a ticket lets a view be
/// written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTicket {
    generation: Option<String>,
}

/// Result of a cache read
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub view: Option<CachedEntitlement>,
    /// `None` when the generation could not be read; the caller must not
    /// write back
    pub ticket: Option<CacheTicket>,
}

impl CacheLookup {
    fn unavailable() -> Self {
        Self {
            view: None,
            ticket: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredView {
    generation: Option<String>,
    view: CachedEntitlement,
}

/// Timeout-bounded, error-swallowing wrapper around a backend
#[derive(Clone)]
pub struct CacheLayer {
    backend: Arc<dyn EntitlementCache>,
    ttl: Duration,
    op_timeout: Duration,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn EntitlementCache>) -> Self {
        Self {
            backend,
            ttl: DEFAULT_CACHE_TTL,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Entry TTL, clamped to [`MAX_CACHE_TTL`]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.min(MAX_CACHE_TTL);
        self
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generation markers outlive the views written under them
    fn generation_ttl(&self) -> Duration {
        self.ttl.saturating_mul(2).min(MAX_CACHE_TTL.saturating_mul(2))
    }

    async fn read(&self, key: &str, identity: &UserIdentity) -> Result<Option<Vec<u8>>, ()> {
        match tokio::time::timeout(self.op_timeout, self.backend.get(key)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => {
                tracing::warn!(identity = %identity, key, error = %e, "cache read failed");
                Err(())
            }
            Err(_) => {
                tracing::warn!(identity = %identity, key, "cache read timed out");
                Err(())
            }
        }
    }

    /// Cached view for an identity plus the ticket needed to write one back.
    /// Errors and timeouts surface as a miss.
    pub async fn get_view(&self, identity: &UserIdentity) -> CacheLookup {
        let Ok(generation) = self.read(&generation_key(identity), identity).await else {
            return CacheLookup::unavailable();
        };
        let ticket = CacheTicket {
            generation: generation.map(|g| String::from_utf8_lossy(&g).into_owned()),
        };

        let view = match self.read(&cache_key(identity), identity).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<StoredView>(&bytes) {
                Ok(stored) if stored.generation == ticket.generation => Some(stored.view),
                Ok(_) => {
                    tracing::debug!(identity = %identity, "cached view predates invalidation");
                    None
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "discarding undecodable cache entry");
                    self.delete(&cache_key(identity), identity).await;
                    None
                }
            },
            Ok(None) | Err(()) => None,
        };

        CacheLookup {
            view,
            ticket: Some(ticket),
        }
    }

    /// Write a view computed after `ticket` was issued
    pub async fn put_view(
        &self,
        identity: &UserIdentity,
        view: &CachedEntitlement,
        ticket: &CacheTicket,
    ) {
        let stored = StoredView {
            generation: ticket.generation.clone(),
            view: view.clone(),
        };
        let bytes = match serde_json::to_vec(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                let e = BillingError::from(e);
                tracing::warn!(identity = %identity, error = %e, "cache encode failed");
                return;
            }
        };

        self.write(&cache_key(identity), bytes, self.ttl, identity)
            .await;
    }

    /// Start a new generation and drop the current view. Views computed
    /// before this call are never served afterwards.
    pub async fn invalidate(&self, identity: &UserIdentity) {
        let generation = Uuid::new_v4().to_string().into_bytes();
        self.write(
            &generation_key(identity),
            generation,
            self.generation_ttl(),
            identity,
        )
        .await;
        self.delete(&cache_key(identity), identity).await;
        tracing::debug!(identity = %identity, "cache entry invalidated");
    }

    async fn write(&self, key: &str, bytes: Vec<u8>, ttl: Duration, identity: &UserIdentity) {
        match tokio::time::timeout(self.op_timeout, self.backend.set(key, bytes, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(identity = %identity, key, error = %e, "cache write failed"),
            Err(_) => tracing::warn!(identity = %identity, key, "cache write timed out"),
        }
    }

    async fn delete(&self, key: &str, identity: &UserIdentity) {
        match tokio::time::timeout(self.op_timeout, self.backend.delete(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(identity = %identity, key, error = %e, "cache delete failed"),
            Err(_) => tracing::warn!(identity = %identity, key, "cache delete timed out"),
        }
    }
}
