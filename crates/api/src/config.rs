//! Application configuration

use std::env;
use std::time::Duration;

use chatmeter_billing::{PlanCatalog, RateLimitRule, MAX_CACHE_TTL};
use chatmeter_shared::SubscriptionTier;

/// Where users, subscriptions and usage live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Which cache sits in front of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Redis,
    Memory,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Store
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Cache
    pub cache_backend: CacheBackend,
    pub redis_url: String,
    pub cache_ttl_secs: u64,
    pub cache_op_timeout_ms: u64,

    // Rate limiting (0 disables)
    pub rate_limit_per_minute: u32,

    // Upstream completion API
    pub openrouter_api_key: String,
    pub openrouter_base_url: String,
    pub upstream_timeout_secs: u64,
    pub frontend_url: String,
    pub app_title: String,

    // Payment plans
    pub plan_id_starter: Option<String>,
    pub plan_id_pro: Option<String>,
    pub plan_id_pro_plus: Option<String>,

    // Worker
    pub expiry_sweep_schedule: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store_backend = match var("STORE_BACKEND").as_deref().map(str::trim) {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => return Err(ConfigError::invalid("STORE_BACKEND", other)),
        };

        let database_url = var("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let cache_backend = match var("CACHE_BACKEND").as_deref().map(str::trim) {
            None | Some("redis") => CacheBackend::Redis,
            Some("memory") => CacheBackend::Memory,
            Some("none") => CacheBackend::None,
            Some(other) => return Err(ConfigError::invalid("CACHE_BACKEND", other)),
        };

        let log_format = match var("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(ConfigError::invalid("LOG_FORMAT", other)),
        };

        let cache_ttl_secs: u64 = parse_or(&var, "CACHE_TTL_SECS", 60)?;
        if cache_ttl_secs == 0 || cache_ttl_secs > MAX_CACHE_TTL.as_secs() {
            return Err(ConfigError::invalid("CACHE_TTL_SECS", &cache_ttl_secs.to_string()));
        }

        Ok(Self {
            store_backend,
            database_url,
            database_max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 20)?,

            cache_backend,
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            cache_ttl_secs,
            cache_op_timeout_ms: parse_or(&var, "CACHE_OP_TIMEOUT_MS", 250)?,

            rate_limit_per_minute: parse_or(&var, "RATE_LIMIT_PER_MINUTE", 20)?,

            openrouter_api_key: var("OPENROUTER_API_KEY")
                .ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?,
            openrouter_base_url: var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            upstream_timeout_secs: parse_or(&var, "UPSTREAM_TIMEOUT_SECS", 30)?,
            frontend_url: var("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            app_title: var("APP_TITLE").unwrap_or_else(|| "Chatmeter".to_string()),

            plan_id_starter: var("PLAN_ID_STARTER"),
            plan_id_pro: var("PLAN_ID_PRO"),
            plan_id_pro_plus: var("PLAN_ID_PRO_PLUS"),

            // Every 15 minutes (seconds field first)
            expiry_sweep_schedule: var("EXPIRY_SWEEP_SCHEDULE")
                .unwrap_or_else(|| "0 */15 * * * *".to_string()),

            log_format,
        })
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_op_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_op_timeout_ms)
    }

    /// Per-user chat rate limit, `None` when disabled
    pub fn chat_rate_limit(&self) -> Option<RateLimitRule> {
        (self.rate_limit_per_minute > 0)
            .then(|| RateLimitRule::per_minute("chat", self.rate_limit_per_minute))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Plan ids configured for each paid tier
    pub fn plan_catalog(&self) -> PlanCatalog {
        let plans = [
            (&self.plan_id_starter, SubscriptionTier::Starter),
            (&self.plan_id_pro, SubscriptionTier::Pro),
            (&self.plan_id_pro_plus, SubscriptionTier::ProPlus),
        ];
        plans
            .into_iter()
            .fold(PlanCatalog::new(), |catalog, (plan_id, tier)| match plan_id {
                Some(id) => catalog.with_plan(id.clone(), tier),
                None => catalog,
            })
    }
}

fn parse_or<T, F>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(key, &raw)),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str) -> Self {
        ConfigError::Invalid {
            var,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/chatmeter"),
            ("OPENROUTER_API_KEY", "sk-or-test"),
        ])
        .unwrap();

        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert_eq!(config.cache_backend, CacheBackend::Redis);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.cache_op_timeout(), Duration::from_millis(250));
        assert_eq!(config.upstream_timeout(), Duration::from_secs(30));
        assert_eq!(config.database_max_connections, 20);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.expiry_sweep_schedule, "0 */15 * * * *");
        assert_eq!(
            config.chat_rate_limit(),
            Some(RateLimitRule::per_minute("chat", 20))
        );
    }

    #[test]
    fn test_required_variables() {
        match load(&[("OPENROUTER_API_KEY", "sk-or-test")]) {
            Err(ConfigError::Missing("DATABASE_URL")) => {}
            other => panic!("expected missing DATABASE_URL, got {:?}", other),
        }

        match load(&[("STORE_BACKEND", "memory")]) {
            Err(ConfigError::Missing("OPENROUTER_API_KEY")) => {}
            other => panic!("expected missing OPENROUTER_API_KEY, got {:?}", other),
        }

        // Memory store does not need a database
        let config = load(&[("STORE_BACKEND", "memory"), ("OPENROUTER_API_KEY", "k")]).unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = [("STORE_BACKEND", "memory"), ("OPENROUTER_API_KEY", "k")];

        let mut pairs = base.to_vec();
        pairs.push(("CACHE_BACKEND", "memcached"));
        assert!(matches!(
            load(&pairs),
            Err(ConfigError::Invalid { var: "CACHE_BACKEND", .. })
        ));

        let mut pairs = base.to_vec();
        pairs.push(("CACHE_TTL_SECS", "soon"));
        assert!(matches!(
            load(&pairs),
            Err(ConfigError::Invalid { var: "CACHE_TTL_SECS", .. })
        ));
    }

    #[test]
    fn test_cache_ttl_bounds() {
        let base = [("STORE_BACKEND", "memory"), ("OPENROUTER_API_KEY", "k")];

        for ttl in ["0", "86401", "18446744073709551615"] {
            let mut pairs = base.to_vec();
            pairs.push(("CACHE_TTL_SECS", ttl));
            assert!(
                matches!(load(&pairs), Err(ConfigError::Invalid { var: "CACHE_TTL_SECS", .. })),
                "ttl {} should be rejected",
                ttl
            );
        }

        let mut pairs = base.to_vec();
        pairs.push(("CACHE_TTL_SECS", "86400"));
        assert_eq!(load(&pairs).unwrap().cache_ttl(), Duration::from_secs(86400));
    }

    #[test]
    fn test_rate_limit_can_be_disabled() {
        let config = load(&[
            ("STORE_BACKEND", "memory"),
            ("OPENROUTER_API_KEY", "k"),
            ("RATE_LIMIT_PER_MINUTE", "0"),
        ])
        .unwrap();
        assert_eq!(config.chat_rate_limit(), None);
    }

    #[test]
    fn test_plan_catalog_from_config() {
        let config = load(&[
            ("STORE_BACKEND", "memory"),
            ("OPENROUTER_API_KEY", "k"),
            ("PLAN_ID_STARTER", "plan_Basic123"),
            ("PLAN_ID_PRO_PLUS", "plan_Max789"),
        ])
        .unwrap();

        let catalog = config.plan_catalog();
        assert_eq!(catalog.tier_for_plan("plan_Basic123"), Some(SubscriptionTier::Starter));
        assert_eq!(catalog.tier_for_plan("plan_Max789"), Some(SubscriptionTier::ProPlus));
        assert_eq!(catalog.tier_for_plan("plan_Unknown"), None);
    }
}
