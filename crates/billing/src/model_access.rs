//! Model access gate
//!
//! Each tier unlocks its own additions on top of everything the tiers below
//! it unlock, so access is monotonic in the tier ordering. Models that no
//! tier lists are refused.
//!
//! Starter and Pro Plus currently add no models of their own: starter sees
//! the free catalog and pro plus sees the pro catalog.

use chatmeter_shared::SubscriptionTier;
use serde::Serialize;

/// Model used when a request does not name one
pub const DEFAULT_MODEL: &str = "tngtech/deepseek-r1t2-chimera:free";

const FREE_MODELS: &[&str] = &[
    "tngtech/deepseek-r1t2-chimera:free",
    "cognitivecomputations/dolphin-mistral-24b-venice-edition:free",
    "meta-llama/llama-3.2-3b-instruct:free",
    "meta-llama/llama-4-maverick:free",
    "qwen/qwen3-30b-a3b:free",
    "qwen/qwen3-235b-a22b:free",
];

const STARTER_MODELS: &[&str] = &[];

const PRO_MODELS: &[&str] = &[
    "x-ai/grok-4-fast",
    "google/gemini-2.5-flash-image",
    "meta-llama/llama-3.3-70b-instruct:free",
];

const PRO_PLUS_MODELS: &[&str] = &[];

/// Models a tier adds on top of the tiers below it
fn tier_additions(tier: SubscriptionTier) -> &'static [&'static str] {
    match tier {
        SubscriptionTier::Free => FREE_MODELS,
        SubscriptionTier::Starter => STARTER_MODELS,
        SubscriptionTier::Pro => PRO_MODELS,
        SubscriptionTier::ProPlus => PRO_PLUS_MODELS,
    }
}

/// Outcome of a model access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum ModelAccess {
    Allowed,
    /// Listed, but only from `required` upwards
    RequiresUpgrade { required: SubscriptionTier },
    /// Not listed by any tier
    Unknown,
}

/// Lowest tier whose allow-list contains the model
pub fn required_tier(model_id: &str) -> Option<SubscriptionTier> {
    let model_id = model_id.trim();
    SubscriptionTier::ALL
        .into_iter()
        .find(|tier| tier_additions(*tier).contains(&model_id))
}

/// Full access decision for a model at a tier
pub fn check_model_access(model_id: &str, tier: SubscriptionTier) -> ModelAccess {
    match required_tier(model_id) {
        Some(required) if required <= tier => ModelAccess::Allowed,
        Some(required) => ModelAccess::RequiresUpgrade { required },
        None => ModelAccess::Unknown,
    }
}

pub fn is_model_allowed(model_id: &str, tier: SubscriptionTier) -> bool {
    check_model_access(model_id, tier) == ModelAccess::Allowed
}

/// Every model available at a tier, lowest tier's models first
pub fn allowed_models(tier: SubscriptionTier) -> Vec<&'static str> {
    tier.at_or_below()
        .flat_map(|t| tier_additions(t).iter().copied())
        .collect()
}
