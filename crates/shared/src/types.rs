//! Common types used across Chatmeter

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::{month_key, StoredInstant};
use crate::error::SharedError;

// =============================================================================
// Identity
// =============================================================================

/// Stable subject identifier issued by the identity provider (`sub` claim)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserIdentity(pub String);

impl UserIdentity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserIdentity {
    fn from(subject: &str) -> Self {
        Self(subject.to_string())
    }
}

impl From<String> for UserIdentity {
    fn from(subject: String) -> Self {
        Self(subject)
    }
}

/// Claims yielded by the external identity verifier once a bearer token
/// has been checked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub subject: UserIdentity,
    pub email: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl VerifiedIdentity {
    pub fn new(subject: impl Into<UserIdentity>) -> Self {
        Self {
            subject: subject.into(),
            email: None,
            display_name: None,
            permissions: Vec::new(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier, ordered from least to most capable
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Starter,
    Pro,
    ProPlus,
}

impl SubscriptionTier {
    /// Every tier in ascending order
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Free,
        SubscriptionTier::Starter,
        SubscriptionTier::Pro,
        SubscriptionTier::ProPlus,
    ];

    /// Tiers strictly above this one, ascending
    pub fn higher(self) -> impl Iterator<Item = SubscriptionTier> {
        Self::ALL.into_iter().filter(move |t| *t > self)
    }

    /// Tiers at or below this one, ascending
    pub fn at_or_below(self) -> impl Iterator<Item = SubscriptionTier> {
        Self::ALL.into_iter().filter(move |t| *t <= self)
    }

    pub fn is_paid_tier(self) -> bool {
        self != SubscriptionTier::Free
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::ProPlus => "pro_plus",
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            // "basic" was the starter plan's name in older profile rows
            "starter" | "basic" => Ok(Self::Starter),
            "pro" | "premium" => Ok(Self::Pro),
            "pro_plus" | "pro-plus" | "proplus" => Ok(Self::ProPlus),
            _ => Err(SharedError::InvalidTier(s.to_string())),
        }
    }
}

/// Lifecycle state of a subscription purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(SharedError::InvalidStatus(s.to_string())),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Persisted user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub identity: UserIdentity,
    pub email: String,
    pub display_name: Option<String>,
    pub tier: SubscriptionTier,
    pub is_paid: bool,
    pub subscription_expiry: Option<StoredInstant>,
}

/// Profile fields captured on first sight of an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub identity: UserIdentity,
    pub email: String,
    pub display_name: Option<String>,
}

impl From<&VerifiedIdentity> for NewUser {
    fn from(claims: &VerifiedIdentity) -> Self {
        Self {
            identity: claims.subject.clone(),
            email: claims.email.clone().unwrap_or_default(),
            display_name: claims.display_name.clone(),
        }
    }
}

/// One row per verified purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_payment_ref: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub period_start: StoredInstant,
    pub period_end: StoredInstant,
}

/// Calendar month a usage row belongs to (`YYYY-MM`, UTC)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsagePeriod(pub String);

impl UsagePeriod {
    /// Period containing `instant`
    pub fn containing(instant: OffsetDateTime) -> Self {
        Self(month_key(instant))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Usage counters for one user and one calendar month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: Uuid,
    pub period: UsagePeriod,
    pub daily_message_count: i64,
    pub total_message_count: i64,
    pub daily_token_count: i64,
    pub total_token_count: i64,
    pub last_reset_at: StoredInstant,
}

impl UsageRecord {
    /// Fresh zeroed counters for the period containing `now`
    pub fn empty(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            period: UsagePeriod::containing(now),
            daily_message_count: 0,
            total_message_count: 0,
            daily_token_count: 0,
            total_token_count: 0,
            last_reset_at: StoredInstant::Aware(now),
        }
    }

    /// Whether the daily counters belong to an earlier UTC day than `now`
    pub fn needs_daily_reset(&self, now: OffsetDateTime) -> bool {
        self.last_reset_at.utc_date() < crate::clock::utc_date(now)
    }

    /// Zero the daily counters and stamp the reset
    pub fn apply_daily_reset(&mut self, now: OffsetDateTime) {
        self.daily_message_count = 0;
        self.daily_token_count = 0;
        self.last_reset_at = StoredInstant::Aware(now);
    }

    /// Add a delta to both daily and month-to-date counters, restarting the
    /// daily counters first if the day has rolled over
    pub fn apply_increment(&mut self, messages: i64, tokens: i64, now: OffsetDateTime) {
        if self.needs_daily_reset(now) {
            self.apply_daily_reset(now);
        }
        self.daily_message_count += messages;
        self.total_message_count += messages;
        self.daily_token_count += tokens;
        self.total_token_count += tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_tier_ordering() {
        assert!(SubscriptionTier::Free < SubscriptionTier::Starter);
        assert!(SubscriptionTier::Starter < SubscriptionTier::Pro);
        assert!(SubscriptionTier::Pro < SubscriptionTier::ProPlus);
        assert_eq!(
            SubscriptionTier::Starter.higher().collect::<Vec<_>>(),
            vec![SubscriptionTier::Pro, SubscriptionTier::ProPlus]
        );
        assert_eq!(SubscriptionTier::Free.at_or_below().count(), 1);
    }

    #[test]
    fn test_tier_parse_and_display() {
        assert_eq!("pro_plus".parse::<SubscriptionTier>(), Ok(SubscriptionTier::ProPlus));
        assert_eq!("Basic".parse::<SubscriptionTier>(), Ok(SubscriptionTier::Starter));
        assert_eq!(SubscriptionTier::ProPlus.to_string(), "pro_plus");
        assert!("gold".parse::<SubscriptionTier>().is_err());
        assert_eq!(
            serde_json::to_string(&SubscriptionTier::ProPlus).unwrap(),
            "\"pro_plus\""
        );
    }

    #[test]
    fn test_status_parse_accepts_us_spelling() {
        assert_eq!("canceled".parse::<SubscriptionStatus>(), Ok(SubscriptionStatus::Cancelled));
        assert_eq!(SubscriptionStatus::Expired.to_string(), "expired");
    }

    #[test]
    fn test_usage_increment_rolls_daily_counters() {
        let user_id = Uuid::new_v4();
        let mut usage = UsageRecord::empty(user_id, datetime!(2025-04-10 22:00 UTC));
        usage.apply_increment(3, 300, datetime!(2025-04-10 23:00 UTC));
        assert_eq!(usage.daily_message_count, 3);

        usage.apply_increment(1, 50, datetime!(2025-04-11 01:00 UTC));
        assert_eq!(usage.daily_message_count, 1);
        assert_eq!(usage.daily_token_count, 50);
        assert_eq!(usage.total_message_count, 4);
        assert_eq!(usage.total_token_count, 350);
        assert!(!usage.needs_daily_reset(datetime!(2025-04-11 23:59 UTC)));
    }

    #[test]
    fn test_new_user_from_claims() {
        let mut claims = VerifiedIdentity::new("auth0|abc");
        claims.email = Some("a@example.com".to_string());
        claims.permissions = vec!["read:data".to_string()];

        let new_user = NewUser::from(&claims);
        assert_eq!(new_user.identity.as_str(), "auth0|abc");
        assert_eq!(new_user.email, "a@example.com");
        assert!(claims.has_permission("read:data"));
        assert!(!claims.has_permission("admin:access"));
    }
}
