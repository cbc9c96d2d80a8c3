//! Usage metering service
//!
//! Records completed chat turns and renders the user-facing usage report.

use std::sync::Arc;

use chatmeter_shared::{Clock, SubscriptionTier, UsagePeriod, UsageRecord, UserIdentity};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::UsageSnapshot;
use crate::error::{BillingError, BillingResult};
use crate::model_access::allowed_models;
use crate::policy::{remaining, TierFeatures, UNLIMITED};
use crate::store::EntitlementStore;

/// Usage metering service
#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn EntitlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a completed turn. Best-effort: failures are logged, never
    /// returned, because the response has already been delivered.
    pub async fn record_usage(&self, identity: &UserIdentity, messages: i64, tokens: i64) {
        if let Err(e) = self.try_record_usage(identity, messages, tokens).await {
            tracing::warn!(
                identity = %identity,
                messages,
                tokens,
                error = %e,
                "failed to record usage"
            );
        }
    }

    /// Best-effort increment when the internal user id is already known
    pub async fn record_usage_for(&self, user_id: Uuid, messages: i64, tokens: i64) {
        if let Err(e) = self.increment(user_id, messages, tokens).await {
            tracing::warn!(user_id = %user_id, messages, tokens, error = %e, "failed to record usage");
        }
    }

    /// Fallible form of [`record_usage`](Self::record_usage)
    pub async fn try_record_usage(
        &self,
        identity: &UserIdentity,
        messages: i64,
        tokens: i64,
    ) -> BillingResult<UsageRecord> {
        let user = self
            .store
            .get_user(identity)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(identity.to_string()))?;

        self.increment(user.user_id, messages, tokens).await
    }

    async fn increment(&self, user_id: Uuid, messages: i64, tokens: i64) -> BillingResult<UsageRecord> {
        if messages < 0 || tokens < 0 {
            return Err(BillingError::InvalidInput(format!(
                "negative usage delta ({} messages, {} tokens)",
                messages, tokens
            )));
        }

        let now = self.clock.now();
        let period = UsagePeriod::containing(now);
        let row = self
            .store
            .increment_usage(user_id, &period, messages, tokens, now)
            .await?;

        tracing::debug!(
            user_id = %user_id,
            period = %period,
            daily_messages = row.daily_message_count,
            monthly_messages = row.total_message_count,
            "usage recorded"
        );
        Ok(row)
    }
}

/// One counter measured against its limit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allowance {
    pub used: i64,
    /// `None` when unlimited
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub percentage_used: Option<f64>,
}

impl Allowance {
    fn new(limit: i64, used: i64) -> Self {
        if limit == UNLIMITED {
            return Self {
                used,
                limit: None,
                remaining: None,
                percentage_used: None,
            };
        }

        let percentage_used = if limit > 0 {
            ((used as f64 / limit as f64) * 100.0).min(100.0)
        } else {
            100.0
        };

        Self {
            used,
            limit: Some(limit),
            remaining: remaining(limit, used),
            percentage_used: Some(percentage_used),
        }
    }
}

/// User-facing usage view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub tier: SubscriptionTier,
    pub is_paid: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_expiry: Option<OffsetDateTime>,
    pub days_remaining: Option<i64>,
    pub messages_today: Allowance,
    pub messages_this_month: Allowance,
    pub tokens_today: Allowance,
    pub tokens_this_month: Allowance,
    #[serde(with = "time::serde::rfc3339")]
    pub next_reset_at: OffsetDateTime,
    pub features: TierFeatures,
    pub models: Vec<&'static str>,
}

impl UsageReport {
    pub fn from_snapshot(snapshot: &UsageSnapshot) -> Self {
        let policy = snapshot.policy();
        Self {
            tier: snapshot.tier,
            is_paid: snapshot.is_paid,
            subscription_expiry: snapshot.subscription_expiry,
            days_remaining: snapshot.days_remaining,
            messages_today: Allowance::new(policy.requests_per_day, snapshot.daily_message_count),
            messages_this_month: Allowance::new(
                policy.requests_per_month,
                snapshot.monthly_message_count,
            ),
            tokens_today: Allowance::new(policy.tokens_per_day, snapshot.daily_token_count),
            tokens_this_month: Allowance::new(policy.tokens_per_month, snapshot.monthly_token_count),
            next_reset_at: snapshot.next_reset_at,
            features: policy.features,
            models: allowed_models(snapshot.tier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chatmeter_shared::{ManualClock, NewUser};
    use time::macros::datetime;

    async fn meter_with_user() -> (Arc<InMemoryStore>, UsageMeter, UserIdentity) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2025-08-20 15:00 UTC)));
        let identity = UserIdentity::from("auth0|meter");
        store
            .create_user(NewUser {
                identity: identity.clone(),
                email: "meter@example.com".to_string(),
                display_name: None,
            })
            .await
            .unwrap();
        (store.clone(), UsageMeter::new(store, clock), identity)
    }

    #[tokio::test]
    async fn test_record_usage_increments_both_windows() {
        let (store, meter, identity) = meter_with_user().await;
        meter.record_usage(&identity, 1, 250).await;
        meter.record_usage(&identity, 1, 100).await;

        let user = store.get_user(&identity).await.unwrap().unwrap();
        let row = store
            .get_usage(user.user_id, &UsagePeriod("2025-08".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.daily_message_count, 2);
        assert_eq!(row.total_message_count, 2);
        assert_eq!(row.daily_token_count, 350);
        assert_eq!(row.total_token_count, 350);
    }

    #[tokio::test]
    async fn test_record_usage_swallows_store_failure() {
        let (store, meter, identity) = meter_with_user().await;
        store.set_fail_writes(true);
        meter.record_usage(&identity, 1, 10).await;

        assert!(matches!(
            meter.try_record_usage(&identity, 1, 10).await,
            Err(BillingError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_and_negative_delta_rejected() {
        let (_store, meter, identity) = meter_with_user().await;
        assert!(matches!(
            meter.try_record_usage(&UserIdentity::from("auth0|ghost"), 1, 0).await,
            Err(BillingError::UserNotFound(_))
        ));
        assert!(matches!(
            meter.try_record_usage(&identity, -1, 0).await,
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_report_for_free_tier() {
        let mut snapshot = UsageSnapshot::default_for(
            UserIdentity::from("auth0|report"),
            datetime!(2025-08-20 15:00 UTC),
        );
        snapshot.daily_message_count = 10;

        let report = UsageReport::from_snapshot(&snapshot);
        assert_eq!(report.messages_today.limit, Some(50));
        assert_eq!(report.messages_today.remaining, Some(40));
        assert_eq!(report.messages_today.percentage_used, Some(20.0));
        assert_eq!(report.messages_this_month.limit, None);
        assert_eq!(report.models.len(), 6);
        assert!(!report.features.document_upload);
    }

    #[test]
    fn test_report_caps_percentage() {
        let mut snapshot = UsageSnapshot::default_for(
            UserIdentity::from("auth0|over"),
            datetime!(2025-08-20 15:00 UTC),
        );
        snapshot.tier = SubscriptionTier::Starter;
        snapshot.monthly_message_count = 1_500;

        let report = UsageReport::from_snapshot(&snapshot);
        assert_eq!(report.messages_this_month.remaining, Some(0));
        assert_eq!(report.messages_this_month.percentage_used, Some(100.0));
        assert_eq!(report.messages_today.limit, None);
    }
}
