//! Subscription lifecycle
//!
//! Consumes verified payment outcomes. Signature checks happen upstream in
//! the payment collaborator; this module only records what was bought.

use std::collections::HashMap;
use std::sync::Arc;

use chatmeter_shared::{
    Clock, NewUser, StoredInstant, SubscriptionRecord, SubscriptionStatus, SubscriptionTier,
    UserIdentity, UserRecord, VerifiedIdentity,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::entitlement::EntitlementResolver;
use crate::error::{BillingError, BillingResult, StoreError};
use crate::store::EntitlementStore;

/// Length of a period when the payment does not state one
pub const DEFAULT_PERIOD: Duration = Duration::days(30);

/// Maps payment-gateway plan ids to tiers
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: HashMap<String, SubscriptionTier>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>, tier: SubscriptionTier) -> Self {
        self.plans.insert(plan_id.into(), tier);
        self
    }

    /// Tier for a plan id. Configured ids win; otherwise a paid tier name
    /// (including legacy aliases) is accepted.
    pub fn tier_for_plan(&self, plan_id: &str) -> Option<SubscriptionTier> {
        if let Some(tier) = self.plans.get(plan_id) {
            return Some(*tier);
        }
        plan_id
            .parse::<SubscriptionTier>()
            .ok()
            .filter(|tier| tier.is_paid_tier())
    }
}

/// Outcome of a verified payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedPayment {
    pub payment_ref: String,
    pub plan_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    /// Amount in the currency's minor unit
    pub amount_minor: i64,
    pub currency: String,
}

/// Subscription lifecycle service
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    resolver: EntitlementResolver,
    catalog: PlanCatalog,
}

impl SubscriptionService {
    pub fn new(resolver: EntitlementResolver, catalog: PlanCatalog) -> Self {
        Self {
            store: resolver.store().clone(),
            clock: resolver.clock().clone(),
            resolver,
            catalog,
        }
    }

    /// Return the profile for a verified identity, creating a free one on
    /// first sight
    pub async fn provision_user(&self, claims: &VerifiedIdentity) -> BillingResult<UserRecord> {
        if let Some(user) = self.store.get_user(&claims.subject).await? {
            return Ok(user);
        }

        match self.store.create_user(NewUser::from(claims)).await {
            Ok(user) => {
                tracing::info!(identity = %claims.subject, user_id = %user.user_id, "provisioned new user");
                Ok(user)
            }
            // Lost the race with a concurrent request for the same identity
            Err(StoreError::Conflict(_)) => self
                .store
                .get_user(&claims.subject)
                .await?
                .ok_or_else(|| BillingError::UserNotFound(claims.subject.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a verified purchase and upgrade the profile
    pub async fn activate(
        &self,
        identity: &UserIdentity,
        payment: VerifiedPayment,
    ) -> BillingResult<SubscriptionRecord> {
        let tier = self
            .catalog
            .tier_for_plan(&payment.plan_id)
            .ok_or_else(|| BillingError::UnknownPlan(payment.plan_id.clone()))?;

        let user = self.require_user(identity).await?;

        if let Some(existing) = self.store.get_subscription_by_ref(&payment.payment_ref).await? {
            if existing.user_id != user.user_id {
                return Err(BillingError::InvalidInput(format!(
                    "payment {} belongs to another account",
                    payment.payment_ref
                )));
            }
            tracing::info!(identity = %identity, payment_ref = %payment.payment_ref, "payment already recorded");
            return Ok(existing);
        }

        let now = self.clock.now();
        let period_end = payment.period_end.unwrap_or(now + DEFAULT_PERIOD);
        if period_end <= now {
            return Err(BillingError::InvalidInput(format!(
                "payment {} period already ended",
                payment.payment_ref
            )));
        }

        // The profile is the synchronous source of truth
        self.store
            .set_user_tier(user.user_id, tier, true, Some(period_end))
            .await?;

        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: user.user_id,
            external_payment_ref: payment.payment_ref.clone(),
            tier,
            status: SubscriptionStatus::Active,
            period_start: StoredInstant::Aware(now),
            period_end: StoredInstant::Aware(period_end),
        };
        if let Err(e) = self.store.insert_subscription(&record).await {
            tracing::warn!(
                identity = %identity,
                payment_ref = %payment.payment_ref,
                error = %e,
                "failed to record subscription row; profile already upgraded"
            );
        }

        self.resolver.invalidate(identity).await;

        tracing::info!(
            identity = %identity,
            tier = %tier,
            payment_ref = %payment.payment_ref,
            amount_minor = payment.amount_minor,
            currency = %payment.currency,
            "subscription activated"
        );
        Ok(record)
    }

    /// Cancel a subscription. The user drops to free immediately when the
    /// cancelled record is the one currently backing their plan.
    pub async fn cancel(&self, identity: &UserIdentity, payment_ref: &str) -> BillingResult<()> {
        let user = self.require_user(identity).await?;

        let subscription = self
            .store
            .get_subscription_by_ref(payment_ref)
            .await?
            .filter(|s| s.user_id == user.user_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(payment_ref.to_string()))?;

        let backs_current_plan = self
            .store
            .get_active_subscription(user.user_id)
            .await?
            .is_some_and(|current| current.external_payment_ref == subscription.external_payment_ref);

        self.store
            .set_subscription_status(payment_ref, SubscriptionStatus::Cancelled)
            .await?;
        if backs_current_plan {
            self.store
                .set_user_tier(user.user_id, SubscriptionTier::Free, false, None)
                .await?;
        }
        self.resolver.invalidate(identity).await;

        tracing::info!(
            identity = %identity,
            tier = %subscription.tier,
            payment_ref = %payment_ref,
            demoted = backs_current_plan,
            "subscription cancelled"
        );
        Ok(())
    }

    async fn require_user(&self, identity: &UserIdentity) -> BillingResult<UserRecord> {
        self.store
            .get_user(identity)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(identity.to_string()))
    }
}
