//! API error types and handling

use chatmeter_billing::{BillingError, Denial, QuotaDenial, StoreError};
use chatmeter_shared::SubscriptionTier;
use serde_json::json;
use uuid::Uuid;

use crate::upstream::UpstreamError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(String),

    // Entitlement denials
    #[error("Quota exceeded: {}", .0.reason)]
    QuotaExceeded(QuotaDenial),
    #[error("Model not allowed: {model}")]
    ModelNotAllowed {
        model: String,
        tier: SubscriptionTier,
        required: Option<SubscriptionTier>,
    },
    #[error("Rate limit exceeded")]
    RateLimited { limit: u32, retry_after_seconds: u32 },

    // Upstream errors
    #[error("Upstream request timed out")]
    GatewayTimeout,
    #[error("Upstream request failed")]
    UpstreamFailed,

    // Internal errors
    #[error("Internal server error (ref {correlation_id})")]
    Internal { correlation_id: Uuid },
}

impl ApiError {
    /// Log the real cause under a fresh correlation id and hide it from the
    /// caller
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(correlation_id = %correlation_id, error = %cause, "internal error");
        ApiError::Internal { correlation_id }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Unauthorized => 401,
            ApiError::Validation(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::QuotaExceeded(_) => 402,
            ApiError::ModelNotAllowed { .. } => 403,
            ApiError::RateLimited { .. } => 429,
            ApiError::GatewayTimeout => 504,
            ApiError::UpstreamFailed => 502,
            ApiError::Internal { .. } => 500,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            ApiError::ModelNotAllowed { .. } => "MODEL_NOT_ALLOWED",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::GatewayTimeout => "GATEWAY_TIMEOUT",
            ApiError::UpstreamFailed => "UPSTREAM_ERROR",
            ApiError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show the end user
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Validation(msg) => msg.clone(),
            ApiError::NotFound(what) => format!("{} not found", what),
            ApiError::QuotaExceeded(denial) => denial.user_message(),
            ApiError::ModelNotAllowed {
                model,
                tier,
                required,
            } => Denial::ModelNotAllowed {
                model: model.clone(),
                tier: *tier,
                required: *required,
            }
            .user_message(),
            ApiError::RateLimited {
                limit,
                retry_after_seconds,
            } => Denial::RateLimited {
                limit: *limit,
                retry_after_seconds: *retry_after_seconds,
            }
            .user_message(),
            ApiError::GatewayTimeout => {
                "The AI service took too long to respond. Please try again.".to_string()
            }
            ApiError::UpstreamFailed => {
                "The AI service is unavailable right now. Please try again.".to_string()
            }
            ApiError::Internal { correlation_id } => format!(
                "Something went wrong on our side. Reference: {}",
                correlation_id
            ),
            ApiError::Unauthorized => self.to_string(),
        }
    }

    /// JSON error body
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        });

        match self {
            ApiError::QuotaExceeded(denial) => {
                body["error"]["tier"] = json!(denial.tier);
                body["error"]["upgrade_to"] = json!(denial.upgrade_to);
                body["error"]["resets_at"] = json!(denial.resets_at.unix_timestamp());
            }
            ApiError::ModelNotAllowed { tier, required, .. } => {
                body["error"]["tier"] = json!(tier);
                body["error"]["required_tier"] = json!(required);
            }
            ApiError::RateLimited {
                retry_after_seconds,
                ..
            } => {
                body["error"]["retry_after"] = json!(retry_after_seconds);
            }
            _ => {}
        }
        body
    }
}

impl From<Denial> for ApiError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::ModelNotAllowed {
                model,
                tier,
                required,
            } => ApiError::ModelNotAllowed {
                model,
                tier,
                required,
            },
            Denial::Quota(denial) => ApiError::QuotaExceeded(denial),
            Denial::RateLimited {
                limit,
                retry_after_seconds,
            } => ApiError::RateLimited {
                limit,
                retry_after_seconds,
            },
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout => {
                tracing::warn!("upstream completion timed out");
                ApiError::GatewayTimeout
            }
            other => {
                tracing::warn!(error = %other, "upstream completion failed");
                ApiError::UpstreamFailed
            }
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::UnknownPlan(plan) => ApiError::Validation(format!("Unknown plan: {}", plan)),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::UserNotFound(_) => ApiError::NotFound("User".to_string()),
            BillingError::SubscriptionNotFound(_) => ApiError::NotFound("Subscription".to_string()),
            other => ApiError::internal(other),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::internal(err)
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chatmeter_billing::{QuotaMetric, QuotaWindow};
    use time::macros::datetime;

    fn quota_denial() -> QuotaDenial {
        QuotaDenial {
            reason: "daily limit reached".to_string(),
            tier: SubscriptionTier::Free,
            metric: QuotaMetric::Messages,
            window: QuotaWindow::Daily,
            limit: 50,
            used: 50,
            upgrade_to: Some(SubscriptionTier::Starter),
            resets_at: datetime!(2025-01-02 0:00 UTC),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::QuotaExceeded(quota_denial()).status_code(), 402);
        assert_eq!(
            ApiError::ModelNotAllowed {
                model: "x-ai/grok-4-fast".to_string(),
                tier: SubscriptionTier::Free,
                required: Some(SubscriptionTier::Pro),
            }
            .status_code(),
            403
        );
        assert_eq!(ApiError::GatewayTimeout.status_code(), 504);
        assert_eq!(ApiError::UpstreamFailed.status_code(), 502);
        assert_eq!(ApiError::Unauthorized.status_code(), 401);
        assert_eq!(ApiError::Validation("x".to_string()).status_code(), 400);
    }

    #[test]
    fn test_quota_body_explains_upgrade() {
        let body = ApiError::QuotaExceeded(quota_denial()).to_body();
        assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
        assert_eq!(body["error"]["tier"], "free");
        assert_eq!(body["error"]["upgrade_to"], "starter");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Upgrade to starter"));
    }

    #[test]
    fn test_internal_errors_hide_cause() {
        let err = ApiError::from(BillingError::Store(StoreError::Database(
            "relation \"users\" does not exist".to_string(),
        )));
        let ApiError::Internal { correlation_id } = err else {
            panic!("expected internal error");
        };

        let err = ApiError::Internal { correlation_id };
        let message = err.public_message();
        assert!(!message.contains("relation"));
        assert!(message.contains(&correlation_id.to_string()));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_upstream_mapping() {
        assert!(matches!(ApiError::from(UpstreamError::Timeout), ApiError::GatewayTimeout));
        assert!(matches!(
            ApiError::from(UpstreamError::Status {
                status: 500,
                message: "boom".to_string()
            }),
            ApiError::UpstreamFailed
        ));
    }

    #[test]
    fn test_rate_limit_body() {
        let err = ApiError::from(Denial::RateLimited {
            limit: 20,
            retry_after_seconds: 12,
        });
        assert_eq!(err.status_code(), 429);

        let body = err.to_body();
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
        assert_eq!(body["error"]["retry_after"], 12);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("12 seconds"));
    }
}
