//! Application state wiring

use std::sync::Arc;

use chatmeter_billing::{
    CacheLayer, EntitlementCache, EntitlementGuard, EntitlementResolver, EntitlementStore,
    ExpirySweeper, InMemoryCache, InMemoryRateLimiter, InMemoryStore, PgStore,
    RateLimitBackend, RateLimiter, RedisCache, RedisRateLimiter, SubscriptionService, UsageMeter,
};
use chatmeter_shared::{create_pool, run_migrations, Clock, SystemClock};

use crate::chat::ChatService;
use crate::config::{CacheBackend, Config, StoreBackend};
use crate::history::{ChatHistory, ChatHistoryStore, InMemoryHistory, PgHistory};
use crate::upstream::{CompletionClient, OpenRouterClient, UpstreamError};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("DATABASE_URL is required for the postgres store")]
    MissingDatabaseUrl,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Upstream client error: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Shared services handed to request handlers and jobs
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn EntitlementStore>,
    pub resolver: EntitlementResolver,
    pub guard: EntitlementGuard,
    pub meter: UsageMeter,
    pub subscriptions: SubscriptionService,
    pub sweeper: ExpirySweeper,
    pub chat: ChatService,
}

impl AppState {
    /// Connect the configured backends and build every service
    pub async fn from_config(config: Config) -> Result<Self, StartupError> {
        let (store, history): (Arc<dyn EntitlementStore>, Arc<dyn ChatHistoryStore>) =
            match config.store_backend {
                StoreBackend::Postgres => {
                    let url = config
                        .database_url
                        .as_deref()
                        .ok_or(StartupError::MissingDatabaseUrl)?;
                    let pool = create_pool(url, config.database_max_connections).await?;
                    run_migrations(&pool).await?;
                    tracing::info!("connected to postgres");
                    (
                        Arc::new(PgStore::new(pool.clone())),
                        Arc::new(PgHistory::new(pool)),
                    )
                }
                StoreBackend::Memory => {
                    tracing::warn!("using in-memory store; data is lost on restart");
                    (
                        Arc::new(InMemoryStore::new()),
                        Arc::new(InMemoryHistory::new()),
                    )
                }
            };

        let redis = match config.cache_backend {
            CacheBackend::Redis => match RedisCache::connect(&config.redis_url).await {
                Ok(redis) => Some(redis),
                // The cache is an optimization only
                Err(e) => {
                    tracing::warn!(error = %e, "redis unavailable, running without entitlement cache");
                    None
                }
            },
            CacheBackend::Memory | CacheBackend::None => None,
        };

        let cache: Option<Arc<dyn EntitlementCache>> = match (&redis, config.cache_backend) {
            (Some(redis), _) => Some(Arc::new(redis.clone())),
            (None, CacheBackend::Memory) => Some(Arc::new(InMemoryCache::new())),
            (None, _) => None,
        };

        // Shared counters when Redis is up; per-process otherwise
        let rate_limits: Arc<dyn RateLimitBackend> = match &redis {
            Some(redis) => Arc::new(RedisRateLimiter::from_cache(redis)),
            None => Arc::new(InMemoryRateLimiter::new()),
        };

        let upstream = OpenRouterClient::new(
            config.openrouter_base_url.clone(),
            config.openrouter_api_key.clone(),
            config.frontend_url.clone(),
            config.app_title.clone(),
            config.upstream_timeout(),
        )?;

        Ok(Self::with_parts(
            config,
            store,
            history,
            cache,
            rate_limits,
            Arc::new(SystemClock),
            Arc::new(upstream),
        ))
    }

    /// Build services over explicit collaborators
    pub fn with_parts(
        config: Config,
        store: Arc<dyn EntitlementStore>,
        history: Arc<dyn ChatHistoryStore>,
        cache: Option<Arc<dyn EntitlementCache>>,
        rate_limits: Arc<dyn RateLimitBackend>,
        clock: Arc<dyn Clock>,
        upstream: Arc<dyn CompletionClient>,
    ) -> Self {
        let mut resolver = EntitlementResolver::new(store.clone(), clock.clone());
        if let Some(backend) = cache {
            resolver = resolver.with_cache(
                CacheLayer::new(backend)
                    .with_ttl(config.cache_ttl())
                    .with_op_timeout(config.cache_op_timeout()),
            );
        }

        let mut guard = EntitlementGuard::new(resolver.clone());
        if let Some(rule) = config.chat_rate_limit() {
            guard = guard.with_rate_limiter(
                RateLimiter::new(rate_limits, clock.clone(), rule)
                    .with_op_timeout(config.cache_op_timeout()),
            );
        }
        let meter = UsageMeter::new(store.clone(), clock.clone());
        let subscriptions = SubscriptionService::new(resolver.clone(), config.plan_catalog());
        let sweeper = ExpirySweeper::new(resolver.clone());
        let chat = ChatService::new(
            subscriptions.clone(),
            guard.clone(),
            meter.clone(),
            ChatHistory::new(history, clock),
            upstream,
        );

        Self {
            config: Arc::new(config),
            store,
            resolver,
            guard,
            meter,
            subscriptions,
            sweeper,
            chat,
        }
    }
}
