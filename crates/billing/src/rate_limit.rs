//! Per-user rate limiting
//!
//! Fixed windows keyed by `ratelimit:{identity}:{action}`. Redis counts with
//! `INCR` + `EXPIRE` so every API instance shares one window; the in-memory
//! backend serves single-process deployments and tests.
//!
//! The limiter fails open: a backend error or timeout is logged and the
//! request is allowed. Quota enforcement does not depend on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatmeter_shared::{Clock, UserIdentity};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::cache::RedisCache;
use crate::error::BillingResult;

/// Default chat requests per window
pub const DEFAULT_REQUESTS_PER_WINDOW: u32 = 20;

/// Default window length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Limit applied to one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub action: String,
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn per_minute(action: impl Into<String>, limit: u32) -> Self {
        Self {
            action: action.into(),
            limit,
            window: DEFAULT_WINDOW,
        }
    }

    fn window_secs(&self) -> i64 {
        i64::try_from(self.window.as_secs().max(1)).unwrap_or(i64::MAX)
    }
}

pub fn rate_limit_key(identity: &UserIdentity, action: &str) -> String {
    format!("ratelimit:{}:{}", identity, action)
}

/// Counter state after one hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Hits in the current window, including this one
    pub count: u64,
    /// Seconds until the window resets
    pub resets_in_secs: i64,
}

/// Rate limit check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
    pub retry_after_seconds: Option<u32>,
}

/// Counting backend
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Count one hit against `key` and report the window state
    async fn hit(
        &self,
        key: &str,
        window_secs: i64,
        now: OffsetDateTime,
    ) -> BillingResult<WindowCount>;
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory rate limiter (for development without Redis)
#[derive(Default)]
pub struct InMemoryRateLimiter {
    /// key -> (count, window_start)
    windows: RwLock<HashMap<String, (u64, i64)>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows that ended before `now`
    pub async fn cleanup(&self, now: OffsetDateTime, window_secs: i64) {
        let cutoff = now.unix_timestamp().saturating_sub(window_secs);
        let mut windows = self.windows.write().await;
        windows.retain(|_, (_, start)| *start > cutoff);
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.windows.read().await.len()
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimiter {
    async fn hit(
        &self,
        key: &str,
        window_secs: i64,
        now: OffsetDateTime,
    ) -> BillingResult<WindowCount> {
        let now = now.unix_timestamp();
        let window_start = now - now.rem_euclid(window_secs);

        let mut windows = self.windows.write().await;
        let entry = windows.entry(key.to_string()).or_insert((0, window_start));

        // Reset if in new window
        if entry.1 != window_start {
            *entry = (0, window_start);
        }
        entry.0 = entry.0.saturating_add(1);

        Ok(WindowCount {
            count: entry.0,
            resets_in_secs: window_start + window_secs - now,
        })
    }
}

// =============================================================================
// Redis backend
// =============================================================================

/// Redis-backed counter shared by every API instance
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Reuse the entitlement cache's connection
    pub fn from_cache(cache: &RedisCache) -> Self {
        Self::new(cache.connection())
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimiter {
    async fn hit(
        &self,
        key: &str,
        window_secs: i64,
        _now: OffsetDateTime,
    ) -> BillingResult<WindowCount> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1u64).await?;
        let mut ttl: i64 = conn.ttl(key).await?;

        // First hit opens the window; a key left without a TTL is repaired
        if count == 1 || ttl < 0 {
            conn.expire::<_, ()>(key, window_secs).await?;
            ttl = window_secs;
        }

        Ok(WindowCount {
            count,
            resets_in_secs: ttl,
        })
    }
}

// =============================================================================
// Limiter
// =============================================================================

/// Rate limiter service
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    clock: Arc<dyn Clock>,
    rule: RateLimitRule,
    op_timeout: Duration,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, clock: Arc<dyn Clock>, rule: RateLimitRule) -> Self {
        Self {
            backend,
            clock,
            rule,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    /// Count a request and decide whether it may proceed
    pub async fn check(&self, identity: &UserIdentity) -> RateLimitResult {
        let now = self.clock.now();
        let key = rate_limit_key(identity, &self.rule.action);
        let window_secs = self.rule.window_secs();

        let hit = tokio::time::timeout(self.op_timeout, self.backend.hit(&key, window_secs, now)).await;
        let window = match hit {
            Ok(Ok(window)) => window,
            Ok(Err(e)) => {
                tracing::warn!(identity = %identity, error = %e, "rate limiter unavailable, allowing request");
                return self.open(now);
            }
            Err(_) => {
                tracing::warn!(identity = %identity, "rate limiter timed out, allowing request");
                return self.open(now);
            }
        };

        let limit = u64::from(self.rule.limit);
        let allowed = window.count <= limit;
        let resets_in = window.resets_in_secs.clamp(0, window_secs);
        let remaining = u32::try_from(limit.saturating_sub(window.count)).unwrap_or(u32::MAX);

        RateLimitResult {
            allowed,
            limit: self.rule.limit,
            remaining,
            reset_at: now + time::Duration::seconds(resets_in),
            retry_after_seconds: (!allowed)
                .then(|| u32::try_from(resets_in.max(1)).unwrap_or(u32::MAX)),
        }
    }

    fn open(&self, now: OffsetDateTime) -> RateLimitResult {
        RateLimitResult {
            allowed: true,
            limit: self.rule.limit,
            remaining: self.rule.limit,
            reset_at: now + time::Duration::seconds(self.rule.window_secs()),
            retry_after_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use chatmeter_shared::ManualClock;
    use time::macros::datetime;

    fn limiter(clock: Arc<ManualClock>, limit: u32) -> (RateLimiter, Arc<InMemoryRateLimiter>) {
        let backend = Arc::new(InMemoryRateLimiter::new());
        let limiter = RateLimiter::new(
            backend.clone(),
            clock,
            RateLimitRule::per_minute("chat", limit),
        );
        (limiter, backend)
    }

    struct FailingBackend;

    #[async_trait]
    impl RateLimitBackend for FailingBackend {
        async fn hit(&self, _: &str, _: i64, _: OffsetDateTime) -> BillingResult<WindowCount> {
            Err(BillingError::Cache("connection refused".to_string()))
        }
    }

    struct StalledBackend;

    #[async_trait]
    impl RateLimitBackend for StalledBackend {
        async fn hit(&self, _: &str, _: i64, _: OffsetDateTime) -> BillingResult<WindowCount> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(WindowCount {
                count: u64::MAX,
                resets_in_secs: 60,
            })
        }
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            rate_limit_key(&UserIdentity::from("auth0|abc"), "chat"),
            "ratelimit:auth0|abc:chat"
        );
    }

    #[tokio::test]
    async fn test_limit_within_window() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-01 12:00:10 UTC)));
        let (limiter, _) = limiter(clock, 3);
        let user = UserIdentity::from("auth0|burst");

        for expected_remaining in [2, 1, 0] {
            let result = limiter.check(&user).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let denied = limiter.check(&user).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_seconds, Some(50));
        assert_eq!(denied.reset_at, datetime!(2025-06-01 12:01:00 UTC));
    }

    #[tokio::test]
    async fn test_window_resets() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-01 12:00:59 UTC)));
        let (limiter, _) = limiter(clock.clone(), 1);
        let user = UserIdentity::from("auth0|reset");

        assert!(limiter.check(&user).await.allowed);
        assert!(!limiter.check(&user).await.allowed);

        clock.advance(time::Duration::seconds(1));
        assert!(limiter.check(&user).await.allowed);
    }

    #[tokio::test]
    async fn test_users_are_counted_separately() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-01 12:00:00 UTC)));
        let (limiter, _) = limiter(clock, 1);

        assert!(limiter.check(&UserIdentity::from("auth0|a")).await.allowed);
        assert!(limiter.check(&UserIdentity::from("auth0|b")).await.allowed);
        assert!(!limiter.check(&UserIdentity::from("auth0|a")).await.allowed);
    }

    #[tokio::test]
    async fn test_cleanup_drops_finished_windows() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-01 12:00:00 UTC)));
        let (limiter, backend) = limiter(clock.clone(), 5);
        limiter.check(&UserIdentity::from("auth0|old")).await;

        clock.advance(time::Duration::minutes(2));
        limiter.check(&UserIdentity::from("auth0|new")).await;
        backend.cleanup(clock.now(), 60).await;

        assert_eq!(backend.tracked_keys().await, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_allows_request() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-01 12:00:00 UTC)));
        let limiter = RateLimiter::new(
            Arc::new(FailingBackend),
            clock,
            RateLimitRule::per_minute("chat", 2),
        );

        let result = limiter.check(&UserIdentity::from("auth0|x")).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_slow_backend_allows_request() {
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-01 12:00:00 UTC)));
        let limiter = RateLimiter::new(
            Arc::new(StalledBackend),
            clock,
            RateLimitRule::per_minute("chat", 2),
        )
        .with_op_timeout(Duration::from_millis(20));

        assert!(limiter.check(&UserIdentity::from("auth0|x")).await.allowed);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_window() {
        let cache = RedisCache::connect("redis://localhost:6379").await.unwrap();
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-01 12:00:00 UTC)));
        let limiter = RateLimiter::new(
            Arc::new(RedisRateLimiter::from_cache(&cache)),
            clock,
            RateLimitRule::per_minute(format!("chat-{}", uuid::Uuid::new_v4()), 1),
        );
        let user = UserIdentity::from("auth0|redis");

        assert!(limiter.check(&user).await.allowed);
        let denied = limiter.check(&user).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds.is_some());
    }
}
