//! Quota enforcement gate
//!
//! Pure decision over a resolved [`UsageSnapshot`] and the policy table. Run
//! it after the resolver so a just-demoted user is judged on free limits.

use chatmeter_shared::clock::next_utc_midnight;
use chatmeter_shared::SubscriptionTier;
use serde::Serialize;
use time::{Month, OffsetDateTime};

use crate::entitlement::UsageSnapshot;
use crate::policy::{limit_reached, minimal_upgrade, policy_for, QuotaMetric, QuotaWindow};

/// Why a request was refused on quota
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDenial {
    pub reason: String,
    pub tier: SubscriptionTier,
    pub metric: QuotaMetric,
    pub window: QuotaWindow,
    pub limit: i64,
    pub used: i64,
    /// Cheapest tier that would have admitted the request
    pub upgrade_to: Option<SubscriptionTier>,
    #[serde(with = "time::serde::rfc3339")]
    pub resets_at: OffsetDateTime,
}

impl QuotaDenial {
    /// Message suitable for showing to the end user
    pub fn user_message(&self) -> String {
        let unit = match self.metric {
            QuotaMetric::Messages => "messages",
            QuotaMetric::Tokens => "tokens",
        };
        let base = format!(
            "You've used {} of {} {} {} on the {} plan.",
            self.used, self.limit, self.window, unit, self.tier
        );
        match self.upgrade_to {
            Some(tier) => format!("{} Upgrade to {} to keep chatting.", base, tier),
            None => format!("{} Your allowance resets at {}.", base, self.resets_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    Allowed,
    Denied(QuotaDenial),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }
}

/// Counts messages only: daily then monthly. Token limits in the policy
/// table are reported to the user but never deny a request.
pub fn check_quota(snapshot: &UsageSnapshot) -> QuotaDecision {
    let policy = policy_for(snapshot.tier);
    let checks = [
        (
            QuotaMetric::Messages,
            QuotaWindow::Daily,
            snapshot.daily_message_count,
            "daily limit reached",
        ),
        (
            QuotaMetric::Messages,
            QuotaWindow::Monthly,
            snapshot.monthly_message_count,
            "monthly limit reached",
        ),
    ];

    for (metric, window, used, reason) in checks {
        let limit = policy.limit(metric, window);
        if limit_reached(limit, used) {
            return QuotaDecision::Denied(QuotaDenial {
                reason: reason.to_string(),
                tier: snapshot.tier,
                metric,
                window,
                limit,
                used,
                upgrade_to: minimal_upgrade(snapshot.tier, metric, window, used),
                resets_at: window_reset(snapshot, window),
            });
        }
    }

    QuotaDecision::Allowed
}

fn window_reset(snapshot: &UsageSnapshot, window: QuotaWindow) -> OffsetDateTime {
    match window {
        QuotaWindow::Daily => snapshot.next_reset_at,
        QuotaWindow::Monthly => next_month_start(snapshot.computed_at),
    }
}

/// Midnight UTC on the first day of the following month
fn next_month_start(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(time::UtcOffset::UTC);
    let (year, month) = match now.month() {
        Month::December => (now.year() + 1, Month::January),
        m => (now.year(), m.next()),
    };
    time::Date::from_calendar_date(year, month, 1)
        .map(|d| d.midnight().assume_utc())
        .unwrap_or_else(|_| next_utc_midnight(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmeter_shared::UserIdentity;
    use time::macros::datetime;

    fn snapshot(tier: SubscriptionTier) -> UsageSnapshot {
        let mut s = UsageSnapshot::default_for(
            UserIdentity::from("auth0|quota"),
            datetime!(2025-12-15 12:00 UTC),
        );
        s.tier = tier;
        s
    }

    #[test]
    fn test_free_daily_limit() {
        let mut s = snapshot(SubscriptionTier::Free);
        s.daily_message_count = 49;
        assert!(check_quota(&s).is_allowed());

        s.daily_message_count = 50;
        match check_quota(&s) {
            QuotaDecision::Denied(denial) => {
                assert_eq!(denial.reason, "daily limit reached");
                assert_eq!(denial.limit, 50);
                assert_eq!(denial.upgrade_to, Some(SubscriptionTier::Starter));
                assert_eq!(denial.resets_at, datetime!(2025-12-16 0:00 UTC));
            }
            QuotaDecision::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_starter_monthly_limit() {
        let mut s = snapshot(SubscriptionTier::Starter);
        s.daily_message_count = 900;
        s.monthly_message_count = 999;
        assert!(check_quota(&s).is_allowed());

        s.monthly_message_count = 1_000;
        match check_quota(&s) {
            QuotaDecision::Denied(denial) => {
                assert_eq!(denial.reason, "monthly limit reached");
                assert_eq!(denial.upgrade_to, Some(SubscriptionTier::Pro));
                assert_eq!(denial.resets_at, datetime!(2026-01-01 0:00 UTC));
            }
            QuotaDecision::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn test_token_counts_never_deny() {
        let mut s = snapshot(SubscriptionTier::Free);
        s.daily_message_count = 1;
        s.daily_token_count = 100_000;
        s.monthly_token_count = 5_000_000;
        assert_eq!(check_quota(&s), QuotaDecision::Allowed);

        let mut s = snapshot(SubscriptionTier::Pro);
        s.monthly_message_count = 10;
        s.monthly_token_count = 10_000_000;
        assert_eq!(check_quota(&s), QuotaDecision::Allowed);
    }

    #[test]
    fn test_pro_plus_never_denied_on_count() {
        let mut s = snapshot(SubscriptionTier::ProPlus);
        s.daily_message_count = 1_000_000;
        s.monthly_message_count = 1_000_000;
        s.monthly_token_count = i64::MAX;
        assert_eq!(check_quota(&s), QuotaDecision::Allowed);
    }

    #[test]
    fn test_user_message_names_tier_and_upgrade() {
        let mut s = snapshot(SubscriptionTier::Free);
        s.daily_message_count = 50;
        let QuotaDecision::Denied(denial) = check_quota(&s) else {
            panic!("expected denial");
        };
        let message = denial.user_message();
        assert!(message.contains("free plan"));
        assert!(message.contains("Upgrade to starter"));
    }
}
