//! Chatmeter Billing
//!
//! Tier policy, entitlement resolution, quota and model gating, usage
//! metering, rate limiting and the subscription lifecycle.

pub mod cache;
pub mod entitlement;
pub mod error;
pub mod expiry;
pub mod guard;
pub mod model_access;
pub mod policy;
pub mod quota;
pub mod rate_limit;
pub mod store;
pub mod subscription;
pub mod usage;

pub use cache::{
    CacheLayer, CachedEntitlement, EntitlementCache, InMemoryCache, RedisCache, MAX_CACHE_TTL,
};
pub use entitlement::{EntitlementResolver, EntitlementSource, UsageSnapshot};
pub use error::{BillingError, BillingResult, StoreError, StoreResult};
pub use expiry::{ExpirySweeper, SweepReport};
pub use guard::{admit_snapshot, Admission, Denial, EntitlementGuard};
pub use model_access::{
    allowed_models, check_model_access, is_model_allowed, required_tier, ModelAccess,
    DEFAULT_MODEL,
};
pub use policy::{policy_for, QuotaMetric, QuotaWindow, TierFeatures, TierPolicy, UNLIMITED};
pub use quota::{check_quota, QuotaDecision, QuotaDenial};
pub use rate_limit::{
    InMemoryRateLimiter, RateLimitBackend, RateLimitResult, RateLimitRule, RateLimiter,
    RedisRateLimiter,
};
pub use store::{EntitlementStore, InMemoryStore, PgStore};
pub use subscription::{PlanCatalog, SubscriptionService, VerifiedPayment};
pub use usage::{Allowance, UsageMeter, UsageReport};
