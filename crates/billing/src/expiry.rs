//! Expiry reconciliation sweep
//!
//! The resolver heals lapsed entitlements on read. The sweep does the same
//! for users who have not made a request since their plan ended.

use std::sync::Arc;

use chatmeter_shared::{Clock, SubscriptionTier};
use serde::Serialize;

use crate::entitlement::EntitlementResolver;
use crate::error::BillingResult;
use crate::store::EntitlementStore;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Active subscriptions moved to `expired`
    pub subscriptions_expired: u64,
    /// Paid profiles dropped to free
    pub users_demoted: u64,
    /// Paid profiles re-synced from a current subscription
    pub users_resynced: u64,
    /// Profiles that could not be updated
    pub failures: u64,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    resolver: EntitlementResolver,
}

impl ExpirySweeper {
    pub fn new(resolver: EntitlementResolver) -> Self {
        Self {
            store: resolver.store().clone(),
            clock: resolver.clock().clone(),
            resolver,
        }
    }

    pub async fn run_once(&self) -> BillingResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport {
            subscriptions_expired: self.store.expire_lapsed_subscriptions(now).await?,
            ..SweepReport::default()
        };

        for user in self.store.list_lapsed_paid_users(now).await? {
            // A renewal may be recorded only in the subscriptions table
            let current = match self.store.get_active_subscription(user.user_id).await {
                Ok(sub) => sub.filter(|s| s.period_end.is_after(now)),
                Err(e) => {
                    tracing::warn!(identity = %user.identity, error = %e, "subscription lookup failed during sweep");
                    None
                }
            };

            let (tier, is_paid, expiry) = match &current {
                Some(sub) => (sub.tier, true, Some(sub.period_end.to_utc())),
                None => (SubscriptionTier::Free, false, None),
            };

            match self.store.set_user_tier(user.user_id, tier, is_paid, expiry).await {
                Ok(()) => {
                    if current.is_some() {
                        report.users_resynced += 1;
                    } else {
                        report.users_demoted += 1;
                    }
                    self.resolver.invalidate(&user.identity).await;
                }
                Err(e) => {
                    tracing::warn!(identity = %user.identity, error = %e, "failed to reconcile lapsed profile");
                    report.failures += 1;
                }
            }
        }

        tracing::info!(
            subscriptions_expired = report.subscriptions_expired,
            users_demoted = report.users_demoted,
            users_resynced = report.users_resynced,
            failures = report.failures,
            "expiry sweep complete"
        );
        Ok(report)
    }
}
