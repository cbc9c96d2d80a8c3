//! Entitlement Module
//!
//! Answers "what tier is this user on, and how much have they used?" by
//! reconciling the cached view, the active subscription row and the user
//! profile.
//!
//! ## Design Principles
//!
//! 1. **Fail-soft**: `resolve()` never returns an error. Lookup failures fall
//!    back to free-tier semantics.
//! 2. **Self-healing**: a lapsed paid state is demoted and written back the
//!    moment it is observed, so later reads agree.
//! 3. **Debuggable**: every snapshot records which source decided it.
//! 4. **One timezone**: every comparison runs on UTC-normalized instants.

use std::sync::Arc;

use chatmeter_shared::clock::{days_until, next_utc_midnight};
use chatmeter_shared::{
    Clock, SubscriptionRecord, SubscriptionStatus, SubscriptionTier, UsagePeriod, UsageRecord,
    UserIdentity, UserRecord,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{CacheLayer, CachedEntitlement};
use crate::policy::{policy_for, TierPolicy};
use crate::store::EntitlementStore;

/// Source that determined the entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    /// Current active subscription row
    Subscription,
    /// User profile fields
    Profile,
    /// No usable record (free tier)
    Default,
}

impl std::fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementSource::Subscription => write!(f, "subscription"),
            EntitlementSource::Profile => write!(f, "profile"),
            EntitlementSource::Default => write!(f, "default"),
        }
    }
}

/// Point-in-time entitlement for one user. Recomputed per request.
///
/// When `is_paid` is true, `subscription_expiry` is later than `computed_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub identity: UserIdentity,
    /// `None` when no profile exists or it could not be read
    pub user_id: Option<Uuid>,
    pub tier: SubscriptionTier,
    pub is_paid: bool,
    pub daily_message_count: i64,
    pub monthly_message_count: i64,
    pub daily_token_count: i64,
    pub monthly_token_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_expiry: Option<OffsetDateTime>,
    /// Whole days left on a paid plan
    pub days_remaining: Option<i64>,
    /// When the daily counters next restart
    #[serde(with = "time::serde::rfc3339")]
    pub next_reset_at: OffsetDateTime,
    pub source: EntitlementSource,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

impl UsageSnapshot {
    /// Conservative free-tier snapshot with zero counters
    pub fn default_for(identity: UserIdentity, now: OffsetDateTime) -> Self {
        Self {
            identity,
            user_id: None,
            tier: SubscriptionTier::Free,
            is_paid: false,
            daily_message_count: 0,
            monthly_message_count: 0,
            daily_token_count: 0,
            monthly_token_count: 0,
            subscription_expiry: None,
            days_remaining: None,
            next_reset_at: next_utc_midnight(now),
            source: EntitlementSource::Default,
            computed_at: now,
        }
    }

    fn assemble(
        identity: &UserIdentity,
        view: &CachedEntitlement,
        usage: &UsageRecord,
        now: OffsetDateTime,
    ) -> Self {
        let (subscription_expiry, days_remaining) = if view.is_paid {
            (
                view.subscription_expiry,
                view.subscription_expiry.map(|expiry| days_until(expiry, now)),
            )
        } else {
            (None, None)
        };

        Self {
            identity: identity.clone(),
            user_id: Some(view.user_id),
            tier: view.tier,
            is_paid: view.is_paid,
            daily_message_count: usage.daily_message_count,
            monthly_message_count: usage.total_message_count,
            daily_token_count: usage.daily_token_count,
            monthly_token_count: usage.total_token_count,
            subscription_expiry,
            days_remaining,
            next_reset_at: next_utc_midnight(usage.last_reset_at.to_utc()),
            source: view.source,
            computed_at: now,
        }
    }

    /// Policy entry for the resolved tier
    pub fn policy(&self) -> &'static TierPolicy {
        policy_for(self.tier)
    }
}

/// Resolves entitlements against an injected store, clock and optional cache
#[derive(Clone)]
pub struct EntitlementResolver {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    cache: Option<CacheLayer>,
}

impl EntitlementResolver {
    pub fn new(store: Arc<dyn EntitlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CacheLayer) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Drop the cached view for an identity (no-op without a cache)
    pub async fn invalidate(&self, identity: &UserIdentity) {
        if let Some(cache) = &self.cache {
            cache.invalidate(identity).await;
        }
    }

    /// Resolve the current entitlement. Never fails: internal errors are
    /// logged and degrade to free-tier semantics.
    pub async fn resolve(&self, identity: &UserIdentity) -> UsageSnapshot {
        let now = self.clock.now();

        let lookup = match &self.cache {
            Some(cache) => Some(cache.get_view(identity).await),
            None => None,
        };
        let cached = lookup
            .as_ref()
            .and_then(|l| l.view.clone())
            .filter(|view| {
                let current = view.is_current(now);
                if !current {
                    tracing::debug!(identity = %identity, "cached entitlement lapsed; re-reading store");
                }
                current
            });

        let view = match cached {
            Some(view) => view,
            None => {
                let user = match self.store.get_user(identity).await {
                    Ok(Some(user)) => user,
                    Ok(None) => {
                        tracing::debug!(identity = %identity, "no profile; using default entitlement");
                        return UsageSnapshot::default_for(identity.clone(), now);
                    }
                    Err(e) => {
                        tracing::warn!(identity = %identity, error = %e, "profile lookup failed; using default entitlement");
                        return UsageSnapshot::default_for(identity.clone(), now);
                    }
                };

                let view = self.reconcile(&user, now).await;
                // Written under the generation read before the store, so an
                // invalidation that raced this resolve wins
                if let (Some(cache), Some(ticket)) =
                    (&self.cache, lookup.as_ref().and_then(|l| l.ticket.as_ref()))
                {
                    cache.put_view(identity, &view, ticket).await;
                }
                view
            }
        };

        let usage = self.load_usage(view.user_id, now).await;
        UsageSnapshot::assemble(identity, &view, &usage, now)
    }

    /// Current month's counters with the daily reset applied. Lookup
    /// failures yield zeroed counters.
    async fn load_usage(&self, user_id: Uuid, now: OffsetDateTime) -> UsageRecord {
        let period = UsagePeriod::containing(now);

        let mut usage = match self.store.get_usage(user_id, &period).await {
            Ok(Some(usage)) => usage,
            Ok(None) => match self.store.create_usage(&UsageRecord::empty(user_id, now)).await {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::warn!(user_id = %user_id, period = %period, error = %e, "failed to create usage row");
                    return UsageRecord::empty(user_id, now);
                }
            },
            Err(e) => {
                tracing::warn!(user_id = %user_id, period = %period, error = %e, "usage lookup failed; assuming zero usage");
                return UsageRecord::empty(user_id, now);
            }
        };

        if usage.needs_daily_reset(now) {
            usage.apply_daily_reset(now);
            // The reset is reflected in this snapshot even if the write fails
            if let Err(e) = self.store.reset_daily_usage(user_id, &period, now).await {
                tracing::warn!(user_id = %user_id, error = %e, "failed to persist daily reset");
            }
        }

        usage
    }

    /// Decide tier and paid state from the subscription row and profile
    async fn reconcile(&self, user: &UserRecord, now: OffsetDateTime) -> CachedEntitlement {
        match self.store.get_active_subscription(user.user_id).await {
            Ok(Some(sub)) if sub.period_end.is_after(now) => {
                if sub.tier != user.tier {
                    tracing::debug!(
                        identity = %user.identity,
                        profile_tier = %user.tier,
                        subscription_tier = %sub.tier,
                        "profile and subscription disagree; subscription wins"
                    );
                }
                CachedEntitlement {
                    user_id: user.user_id,
                    tier: sub.tier,
                    is_paid: true,
                    subscription_expiry: Some(sub.period_end.to_utc()),
                    source: EntitlementSource::Subscription,
                }
            }
            Ok(Some(sub)) => self.demote(user, Some(&sub)).await,
            Ok(None) => self.from_profile(user, now).await,
            Err(e) => {
                tracing::warn!(identity = %user.identity, error = %e, "subscription lookup failed; falling back to profile");
                self.from_profile(user, now).await
            }
        }
    }

    async fn from_profile(&self, user: &UserRecord, now: OffsetDateTime) -> CachedEntitlement {
        if user.is_paid {
            return match user.subscription_expiry {
                Some(expiry) if expiry.is_after(now) => CachedEntitlement {
                    user_id: user.user_id,
                    tier: user.tier,
                    is_paid: true,
                    subscription_expiry: Some(expiry.to_utc()),
                    source: EntitlementSource::Profile,
                },
                _ => self.demote(user, None).await,
            };
        }

        if user.tier != SubscriptionTier::Free {
            tracing::info!(identity = %user.identity, tier = %user.tier, "unpaid profile on paid tier; healing to free");
            return self.demote(user, None).await;
        }

        free_view(user.user_id)
    }

    /// Persist a demotion to free (best-effort) and return the free view
    async fn demote(
        &self,
        user: &UserRecord,
        lapsed: Option<&SubscriptionRecord>,
    ) -> CachedEntitlement {
        let profile_is_free = user.tier == SubscriptionTier::Free
            && !user.is_paid
            && user.subscription_expiry.is_none();

        if !profile_is_free {
            tracing::info!(identity = %user.identity, tier = %user.tier, "entitlement lapsed; demoting to free");
            if let Err(e) = self
                .store
                .set_user_tier(user.user_id, SubscriptionTier::Free, false, None)
                .await
            {
                tracing::warn!(identity = %user.identity, error = %e, "failed to persist demotion");
            }
        }

        if let Some(sub) = lapsed {
            if let Err(e) = self
                .store
                .set_subscription_status(&sub.external_payment_ref, SubscriptionStatus::Expired)
                .await
            {
                tracing::warn!(payment_ref = %sub.external_payment_ref, error = %e, "failed to expire subscription");
            }
        }

        self.invalidate(&user.identity).await;
        free_view(user.user_id)
    }
}

fn free_view(user_id: Uuid) -> CachedEntitlement {
    CachedEntitlement {
        user_id,
        tier: SubscriptionTier::Free,
        is_paid: false,
        subscription_expiry: None,
        source: EntitlementSource::Profile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::store::InMemoryStore;
    use chatmeter_shared::{ManualClock, StoredInstant};
    use time::macros::datetime;
    use time::Duration;

    fn user(identity: &str, tier: SubscriptionTier, is_paid: bool) -> UserRecord {
        UserRecord {
            user_id: Uuid::new_v4(),
            identity: UserIdentity::from(identity),
            email: format!("{}@example.com", identity),
            display_name: None,
            tier,
            is_paid,
            subscription_expiry: None,
        }
    }

    fn setup(now: OffsetDateTime) -> (Arc<InMemoryStore>, Arc<ManualClock>, EntitlementResolver) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let resolver = EntitlementResolver::new(store.clone(), clock.clone());
        (store, clock, resolver)
    }

    #[test]
    fn test_default_snapshot() {
        let now = datetime!(2025-03-01 10:00 UTC);
        let snapshot = UsageSnapshot::default_for(UserIdentity::from("x"), now);
        assert_eq!(snapshot.tier, SubscriptionTier::Free);
        assert_eq!(snapshot.source, EntitlementSource::Default);
        assert_eq!(snapshot.next_reset_at, datetime!(2025-03-02 0:00 UTC));
        assert_eq!(snapshot.policy().requests_per_day, 50);
    }

    #[tokio::test]
    async fn test_unpaid_paid_tier_is_healed() {
        let (store, _clock, resolver) = setup(datetime!(2025-03-01 10:00 UTC));
        let stale = user("auth0|stale", SubscriptionTier::Starter, false);
        store.put_user(stale.clone()).await;

        let snapshot = resolver.resolve(&stale.identity).await;
        assert_eq!(snapshot.tier, SubscriptionTier::Free);
        assert_eq!(store.tier_writes(), 1);

        let healed = store.get_user(&stale.identity).await.unwrap().unwrap();
        assert_eq!(healed.tier, SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn test_paid_profile_without_expiry_is_demoted() {
        let (store, _clock, resolver) = setup(datetime!(2025-03-01 10:00 UTC));
        let odd = user("auth0|no-expiry", SubscriptionTier::Pro, true);
        store.put_user(odd.clone()).await;

        let snapshot = resolver.resolve(&odd.identity).await;
        assert!(!snapshot.is_paid);
        assert_eq!(snapshot.tier, SubscriptionTier::Free);
        assert_eq!(snapshot.days_remaining, None);
    }

    #[tokio::test]
    async fn test_days_remaining_counts_whole_days() {
        let now = datetime!(2025-03-01 10:00 UTC);
        let (store, _clock, resolver) = setup(now);
        let mut paid = user("auth0|paid", SubscriptionTier::Pro, true);
        paid.subscription_expiry = Some(StoredInstant::Aware(now + Duration::hours(24 * 10 + 5)));
        store.put_user(paid.clone()).await;

        let snapshot = resolver.resolve(&paid.identity).await;
        assert_eq!(snapshot.source, EntitlementSource::Profile);
        assert_eq!(snapshot.days_remaining, Some(10));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_profile_lookup() {
        let now = datetime!(2025-03-01 10:00 UTC);
        let (store, _clock, resolver) = setup(now);
        let resolver = resolver.with_cache(CacheLayer::new(Arc::new(InMemoryCache::new())));
        let mut paid = user("auth0|cached", SubscriptionTier::ProPlus, true);
        paid.subscription_expiry = Some(StoredInstant::Aware(now + Duration::days(5)));
        store.put_user(paid.clone()).await;

        let first = resolver.resolve(&paid.identity).await;
        assert_eq!(first.tier, SubscriptionTier::ProPlus);

        store.set_fail_reads(true);
        let second = resolver.resolve(&paid.identity).await;
        assert_eq!(second.tier, SubscriptionTier::ProPlus);
        assert!(second.is_paid);
        // counters come from the store and were unreadable
        assert_eq!(second.daily_message_count, 0);
    }

    #[tokio::test]
    async fn test_lapsed_cache_entry_goes_back_to_store() {
        let now = datetime!(2025-03-01 10:00 UTC);
        let (store, clock, resolver) = setup(now);
        let resolver = resolver.with_cache(CacheLayer::new(Arc::new(InMemoryCache::new())));
        let mut paid = user("auth0|lapsing", SubscriptionTier::Pro, true);
        paid.subscription_expiry = Some(StoredInstant::Aware(now + Duration::minutes(5)));
        store.put_user(paid.clone()).await;

        assert!(resolver.resolve(&paid.identity).await.is_paid);

        clock.advance(Duration::minutes(10));
        let snapshot = resolver.resolve(&paid.identity).await;
        assert!(!snapshot.is_paid);
        assert_eq!(snapshot.tier, SubscriptionTier::Free);
        assert_eq!(store.tier_writes(), 1);
    }

    #[tokio::test]
    async fn test_lapsed_subscription_row_is_marked_expired() {
        let now = datetime!(2025-03-01 10:00 UTC);
        let (store, _clock, resolver) = setup(now);
        let member = user("auth0|sub", SubscriptionTier::Pro, true);
        store.put_user(member.clone()).await;
        store
            .put_subscription(SubscriptionRecord {
                id: Uuid::new_v4(),
                user_id: member.user_id,
                external_payment_ref: "pay_old".to_string(),
                tier: SubscriptionTier::Pro,
                status: SubscriptionStatus::Active,
                period_start: StoredInstant::Aware(now - Duration::days(31)),
                period_end: StoredInstant::Aware(now - Duration::days(1)),
            })
            .await;

        resolver.resolve(&member.identity).await;

        let row = store.get_subscription_by_ref("pay_old").await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Expired);
        assert!(store.get_active_subscription(member.user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_huge_cache_ttl_does_not_break_resolve() {
        let now = datetime!(2025-03-01 10:00 UTC);
        let (store, _clock, resolver) = setup(now);
        let resolver = resolver.with_cache(
            CacheLayer::new(Arc::new(InMemoryCache::new()))
                .with_ttl(std::time::Duration::from_secs(u64::MAX)),
        );
        let mut paid = user("auth0|long-ttl", SubscriptionTier::Pro, true);
        paid.subscription_expiry = Some(StoredInstant::Aware(now + Duration::days(3)));
        store.put_user(paid.clone()).await;

        assert_eq!(resolver.resolve(&paid.identity).await.tier, SubscriptionTier::Pro);
        // second call is served from the cache
        store.set_fail_reads(true);
        assert_eq!(resolver.resolve(&paid.identity).await.tier, SubscriptionTier::Pro);
    }
}
