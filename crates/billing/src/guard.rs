//! Admission guard
//!
//! Runs before any handler body that spends upstream capacity: resolve the
//! entitlement, check the model, check quota, then count the request
//! against the per-user rate limit.

use chatmeter_shared::{SubscriptionTier, UserIdentity};
use serde::Serialize;

use crate::entitlement::{EntitlementResolver, UsageSnapshot};
use crate::model_access::{check_model_access, ModelAccess};
use crate::quota::{check_quota, QuotaDecision, QuotaDenial};
use crate::rate_limit::RateLimiter;

/// Why a request was turned away
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Denial {
    ModelNotAllowed {
        model: String,
        tier: SubscriptionTier,
        /// `None` when no tier offers the model
        required: Option<SubscriptionTier>,
    },
    Quota(QuotaDenial),
    RateLimited {
        limit: u32,
        retry_after_seconds: u32,
    },
}

impl Denial {
    /// Message suitable for showing to the end user
    pub fn user_message(&self) -> String {
        match self {
            Denial::ModelNotAllowed {
                model,
                tier,
                required: Some(required),
            } => format!(
                "{} is not available on the {} plan. Upgrade to {} to use it.",
                model, tier, required
            ),
            Denial::ModelNotAllowed {
                model,
                required: None,
                ..
            } => format!("{} is not an available model.", model),
            Denial::Quota(denial) => denial.user_message(),
            Denial::RateLimited {
                retry_after_seconds,
                ..
            } => format!(
                "Too many requests. Please wait {} seconds and try again.",
                retry_after_seconds
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Granted(UsageSnapshot),
    Denied { snapshot: UsageSnapshot, denial: Denial },
}

/// Model gate then quota gate over an already-resolved snapshot
pub fn admit_snapshot(snapshot: UsageSnapshot, model: &str) -> Admission {
    let required = match check_model_access(model, snapshot.tier) {
        ModelAccess::Allowed => None,
        ModelAccess::RequiresUpgrade { required } => Some(Some(required)),
        ModelAccess::Unknown => Some(None),
    };

    if let Some(required) = required {
        let denial = Denial::ModelNotAllowed {
            model: model.trim().to_string(),
            tier: snapshot.tier,
            required,
        };
        return Admission::Denied { snapshot, denial };
    }

    match check_quota(&snapshot) {
        QuotaDecision::Allowed => Admission::Granted(snapshot),
        QuotaDecision::Denied(denial) => Admission::Denied {
            snapshot,
            denial: Denial::Quota(denial),
        },
    }
}

/// Guard step in front of chat handlers
#[derive(Clone)]
pub struct EntitlementGuard {
    resolver: EntitlementResolver,
    rate_limiter: Option<RateLimiter>,
}

impl EntitlementGuard {
    pub fn new(resolver: EntitlementResolver) -> Self {
        Self {
            resolver,
            rate_limiter: None,
        }
    }

    /// Count admitted requests against a per-user rate limit
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn resolver(&self) -> &EntitlementResolver {
        &self.resolver
    }

    pub async fn admit(&self, identity: &UserIdentity, model: &str) -> Admission {
        let snapshot = self.resolver.resolve(identity).await;
        let admission = match (admit_snapshot(snapshot, model), &self.rate_limiter) {
            // Only requests that pass the entitlement gates use up the window
            (Admission::Granted(snapshot), Some(limiter)) => {
                let result = limiter.check(identity).await;
                match result.retry_after_seconds {
                    Some(retry_after_seconds) if !result.allowed => Admission::Denied {
                        snapshot,
                        denial: Denial::RateLimited {
                            limit: result.limit,
                            retry_after_seconds,
                        },
                    },
                    _ => Admission::Granted(snapshot),
                }
            }
            (admission, _) => admission,
        };

        if let Admission::Denied { denial, snapshot } = &admission {
            tracing::info!(
                identity = %identity,
                tier = %snapshot.tier,
                model = %model,
                denial = ?denial,
                "request denied"
            );
        }
        admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{InMemoryRateLimiter, RateLimitRule};
    use crate::store::InMemoryStore;
    use chatmeter_shared::ManualClock;
    use std::sync::Arc;
    use time::macros::datetime;

    fn snapshot(tier: SubscriptionTier) -> UsageSnapshot {
        let mut s = UsageSnapshot::default_for(
            UserIdentity::from("auth0|guard"),
            datetime!(2025-10-01 9:00 UTC),
        );
        s.tier = tier;
        s
    }

    #[test]
    fn test_model_checked_before_quota() {
        let mut s = snapshot(SubscriptionTier::Free);
        s.daily_message_count = 50;

        match admit_snapshot(s, "x-ai/grok-4-fast") {
            Admission::Denied { denial, .. } => {
                assert_eq!(
                    denial,
                    Denial::ModelNotAllowed {
                        model: "x-ai/grok-4-fast".to_string(),
                        tier: SubscriptionTier::Free,
                        required: Some(SubscriptionTier::Pro),
                    }
                );
                assert!(denial.user_message().contains("Upgrade to pro"));
            }
            Admission::Granted(_) => panic!("expected denial"),
        }
    }

    #[test]
    fn test_quota_denial_after_model_passes() {
        let mut s = snapshot(SubscriptionTier::Free);
        s.daily_message_count = 50;

        assert!(matches!(
            admit_snapshot(s, crate::model_access::DEFAULT_MODEL),
            Admission::Denied {
                denial: Denial::Quota(_),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_model_denied() {
        match admit_snapshot(snapshot(SubscriptionTier::ProPlus), "mystery/model") {
            Admission::Denied { denial, .. } => {
                assert!(matches!(denial, Denial::ModelNotAllowed { required: None, .. }));
                assert_eq!(denial.user_message(), "mystery/model is not an available model.");
            }
            Admission::Granted(_) => panic!("expected denial"),
        }
    }

    #[test]
    fn test_granted_carries_snapshot() {
        let s = snapshot(SubscriptionTier::Pro);
        match admit_snapshot(s.clone(), "x-ai/grok-4-fast") {
            Admission::Granted(granted) => assert_eq!(granted, s),
            Admission::Denied { .. } => panic!("expected grant"),
        }
    }

    fn limited_guard(limit: u32) -> EntitlementGuard {
        let clock = Arc::new(ManualClock::new(datetime!(2025-10-01 9:00:30 UTC)));
        let resolver = EntitlementResolver::new(Arc::new(InMemoryStore::new()), clock.clone());
        let limiter = RateLimiter::new(
            Arc::new(InMemoryRateLimiter::new()),
            clock,
            RateLimitRule::per_minute("chat", limit),
        );
        EntitlementGuard::new(resolver).with_rate_limiter(limiter)
    }

    #[tokio::test]
    async fn test_rate_limit_after_entitlement_gates() {
        let guard = limited_guard(2);
        let user = UserIdentity::from("auth0|chatty");

        for _ in 0..2 {
            assert!(matches!(
                guard.admit(&user, crate::model_access::DEFAULT_MODEL).await,
                Admission::Granted(_)
            ));
        }

        match guard.admit(&user, crate::model_access::DEFAULT_MODEL).await {
            Admission::Denied { denial, .. } => {
                assert_eq!(
                    denial,
                    Denial::RateLimited {
                        limit: 2,
                        retry_after_seconds: 30,
                    }
                );
                assert!(denial.user_message().contains("wait 30 seconds"));
            }
            Admission::Granted(_) => panic!("expected rate limit"),
        }
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_use_rate_window() {
        let guard = limited_guard(1);
        let user = UserIdentity::from("auth0|window");

        // Model denial happens before the limiter counts anything
        for _ in 0..3 {
            assert!(matches!(
                guard.admit(&user, "x-ai/grok-4-fast").await,
                Admission::Denied {
                    denial: Denial::ModelNotAllowed { .. },
                    ..
                }
            ));
        }

        assert!(matches!(
            guard.admit(&user, crate::model_access::DEFAULT_MODEL).await,
            Admission::Granted(_)
        ));
    }
}
