//! Storage strategies for users, subscriptions and usage counters
//!
//! The strategy is chosen once at start-up and shared as
//! `Arc<dyn EntitlementStore>`.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chatmeter_shared::{
    NewUser, SubscriptionRecord, SubscriptionStatus, SubscriptionTier, UsagePeriod, UsageRecord,
    UserIdentity, UserRecord,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StoreResult;

/// Data-access layer behind the entitlement resolver.
///
/// Implementations only fetch and persist. Expiry, reset and tie-break
/// decisions live in [`EntitlementResolver`](crate::EntitlementResolver).
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Look up a profile by external identity
    async fn get_user(&self, identity: &UserIdentity) -> StoreResult<Option<UserRecord>>;

    /// Insert a free-tier profile. Fails with `StoreError::Conflict` when the
    /// identity already exists.
    async fn create_user(&self, new_user: NewUser) -> StoreResult<UserRecord>;

    /// Overwrite the subscription fields of a profile
    async fn set_user_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        is_paid: bool,
        expiry: Option<OffsetDateTime>,
    ) -> StoreResult<()>;

    /// Most recent subscription with status `active`
    async fn get_active_subscription(&self, user_id: Uuid)
        -> StoreResult<Option<SubscriptionRecord>>;

    async fn get_subscription_by_ref(
        &self,
        payment_ref: &str,
    ) -> StoreResult<Option<SubscriptionRecord>>;

    async fn insert_subscription(&self, record: &SubscriptionRecord) -> StoreResult<()>;

    /// Returns false when no subscription carries `payment_ref`
    async fn set_subscription_status(
        &self,
        payment_ref: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<bool>;

    async fn get_usage(&self, user_id: Uuid, period: &UsagePeriod)
        -> StoreResult<Option<UsageRecord>>;

    /// Insert zeroed counters, returning the existing row if another request
    /// created it first
    async fn create_usage(&self, record: &UsageRecord) -> StoreResult<UsageRecord>;

    /// Zero the daily counters if `last_reset_at` falls on an earlier UTC day
    /// than `at`. Returns whether a reset happened.
    async fn reset_daily_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
        at: OffsetDateTime,
    ) -> StoreResult<bool>;

    /// Atomically add to the daily and month-to-date counters (creating the
    /// row if needed). A day rollover restarts the daily counters at the delta.
    async fn increment_usage(
        &self,
        user_id: Uuid,
        period: &UsagePeriod,
        messages: i64,
        tokens: i64,
        at: OffsetDateTime,
    ) -> StoreResult<UsageRecord>;

    /// Profiles still flagged paid whose expiry is missing or before `now`
    async fn list_lapsed_paid_users(&self, now: OffsetDateTime) -> StoreResult<Vec<UserRecord>>;

    /// Mark active subscriptions whose period ended before `now` as expired
    async fn expire_lapsed_subscriptions(&self, now: OffsetDateTime) -> StoreResult<u64>;
}
