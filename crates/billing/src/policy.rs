//! Tier policy table
//!
//! Static per-tier quotas and feature flags. `UNLIMITED` (-1) disables a limit.

use chatmeter_shared::SubscriptionTier;
use serde::Serialize;

/// Sentinel for "no limit"
pub const UNLIMITED: i64 = -1;

/// What a quota counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMetric {
    Messages,
    Tokens,
}

/// Window a quota is evaluated over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    Daily,
    Monthly,
}

impl std::fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaWindow::Daily => write!(f, "daily"),
            QuotaWindow::Monthly => write!(f, "monthly"),
        }
    }
}

/// Feature flags based on tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierFeatures {
    /// Document upload and extraction
    pub document_upload: bool,
    /// Image-capable models
    pub image_models: bool,
    /// Repository import from GitHub
    pub github_integration: bool,
    /// Priority routing at the upstream aggregator
    pub priority_routing: bool,
}

/// Quotas and features for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierPolicy {
    pub tier: SubscriptionTier,
    pub requests_per_day: i64,
    pub requests_per_month: i64,
    pub tokens_per_day: i64,
    pub tokens_per_month: i64,
    pub features: TierFeatures,
}

impl TierPolicy {
    /// Limit for a metric/window pair
    pub fn limit(&self, metric: QuotaMetric, window: QuotaWindow) -> i64 {
        match (metric, window) {
            (QuotaMetric::Messages, QuotaWindow::Daily) => self.requests_per_day,
            (QuotaMetric::Messages, QuotaWindow::Monthly) => self.requests_per_month,
            (QuotaMetric::Tokens, QuotaWindow::Daily) => self.tokens_per_day,
            (QuotaMetric::Tokens, QuotaWindow::Monthly) => self.tokens_per_month,
        }
    }

    /// Check if a specific feature is enabled
    pub fn has_feature(&self, feature: &str) -> bool {
        match feature {
            "document_upload" => self.features.document_upload,
            "image_models" => self.features.image_models,
            "github_integration" => self.features.github_integration,
            "priority_routing" => self.features.priority_routing,
            _ => false,
        }
    }
}

static FREE: TierPolicy = TierPolicy {
    tier: SubscriptionTier::Free,
    requests_per_day: 50,
    requests_per_month: UNLIMITED,
    tokens_per_day: 100_000,
    tokens_per_month: UNLIMITED,
    features: TierFeatures {
        document_upload: false,
        image_models: false,
        github_integration: false,
        priority_routing: false,
    },
};

static STARTER: TierPolicy = TierPolicy {
    tier: SubscriptionTier::Starter,
    requests_per_day: UNLIMITED,
    requests_per_month: 1_000,
    tokens_per_day: UNLIMITED,
    tokens_per_month: 2_000_000,
    features: TierFeatures {
        document_upload: true,
        image_models: false,
        github_integration: false,
        priority_routing: false,
    },
};

static PRO: TierPolicy = TierPolicy {
    tier: SubscriptionTier::Pro,
    requests_per_day: UNLIMITED,
    requests_per_month: 5_000,
    tokens_per_day: UNLIMITED,
    tokens_per_month: 10_000_000,
    features: TierFeatures {
        document_upload: true,
        image_models: true,
        github_integration: true,
        priority_routing: false,
    },
};

static PRO_PLUS: TierPolicy = TierPolicy {
    tier: SubscriptionTier::ProPlus,
    requests_per_day: UNLIMITED,
    requests_per_month: UNLIMITED,
    tokens_per_day: UNLIMITED,
    tokens_per_month: UNLIMITED,
    features: TierFeatures {
        document_upload: true,
        image_models: true,
        github_integration: true,
        priority_routing: true,
    },
};

/// Policy entry for a tier
pub fn policy_for(tier: SubscriptionTier) -> &'static TierPolicy {
    match tier {
        SubscriptionTier::Free => &FREE,
        SubscriptionTier::Starter => &STARTER,
        SubscriptionTier::Pro => &PRO,
        SubscriptionTier::ProPlus => &PRO_PLUS,
    }
}

/// True when `used` has reached a (non-unlimited) `limit`
pub fn limit_reached(limit: i64, used: i64) -> bool {
    limit != UNLIMITED && used >= limit
}

/// Remaining allowance, `None` when unlimited
pub fn remaining(limit: i64, used: i64) -> Option<i64> {
    if limit == UNLIMITED {
        None
    } else {
        Some((limit - used).max(0))
    }
}

/// Cheapest tier above `current` whose limit for this metric/window would
/// admit `used + 1`
pub fn minimal_upgrade(
    current: SubscriptionTier,
    metric: QuotaMetric,
    window: QuotaWindow,
    used: i64,
) -> Option<SubscriptionTier> {
    current
        .higher()
        .find(|tier| !limit_reached(policy_for(*tier).limit(metric, window), used))
}
