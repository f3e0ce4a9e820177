//! Error taxonomy shared across the workspace.
//!
//! Errors split into two families: *expected* domain errors (validation,
//! auth, quota, business rules) that map straight to client-visible codes,
//! and *infrastructure* errors (provider/store outages) that feed circuit
//! breakers and may be retried at component boundaries.

use thiserror::Error;

/// Limit class reported with a quota denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    DailyHard,
    MonthlyHard,
    TotalHard,
}

impl std::fmt::Display for LimitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyHard => write!(f, "daily_hard"),
            Self::MonthlyHard => write!(f, "monthly_hard"),
            Self::TotalHard => write!(f, "total_hard"),
        }
    }
}

/// Workspace-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: requires {required}")]
    Unauthorized {
        required: String,
        held: Vec<String>,
    },

    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {limit_class} limit {limit} reached (current {current}, requested {requested})")]
    QuotaExceeded {
        limit_class: LimitClass,
        limit: f64,
        current: f64,
        requested: f64,
        remaining: f64,
    },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("provider {provider} error: {message}")]
    ProviderError {
        provider: String,
        message: String,
        correlation_id: Option<String>,
    },

    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("counter store unavailable: {0}")]
    CounterUnavailable(String),

    #[error("business rule violated: {rule}")]
    BusinessRule { rule: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    pub fn business_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BusinessRule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// HTTP status the error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::BusinessRule { .. } => 400,
            Self::Unauthenticated(_) => 401,
            Self::Unauthorized { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::QuotaExceeded { .. } | Self::RateLimit { .. } => 429,
            Self::ProviderError { .. } => 502,
            Self::ProviderUnavailable { .. }
            | Self::StoreUnavailable(_)
            | Self::CounterUnavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Whether a retry at the originating boundary can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_)
                | Self::ProviderUnavailable { .. }
                | Self::StoreUnavailable(_)
                | Self::CounterUnavailable(_)
        )
    }

    /// Infrastructure errors feed circuit breakers; domain errors do not.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::ProviderError { .. }
                | Self::StoreUnavailable(_)
                | Self::CounterUnavailable(_)
        )
    }

    /// Short machine-readable code for audit rows and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RateLimit { .. } => "rate_limit",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::CounterUnavailable(_) => "counter_unavailable",
            Self::BusinessRule { .. } => "business_rule",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(Error::validation("slug", "too short").status_code(), 400);
        assert_eq!(Error::Unauthenticated("no token".into()).status_code(), 401);
        assert_eq!(
            Error::Unauthorized {
                required: "voice_agent:update".into(),
                held: vec![],
            }
            .status_code(),
            403
        );
        assert_eq!(Error::not_found("tenant").status_code(), 404);
        assert_eq!(Error::RateLimit { retry_after_secs: 30 }.status_code(), 429);
        assert_eq!(Error::StoreUnavailable("down".into()).status_code(), 503);
    }

    #[test]
    fn retryable_is_limited_to_transient_kinds() {
        assert!(Error::Conflict("version".into()).is_retryable());
        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(!Error::validation("f", "m").is_retryable());
        assert!(!Error::Unauthenticated("x".into()).is_retryable());
    }

    #[test]
    fn infrastructure_excludes_domain_errors() {
        assert!(Error::ProviderUnavailable {
            provider: "tts".into(),
            message: "timeout".into(),
        }
        .is_infrastructure());
        assert!(!Error::QuotaExceeded {
            limit_class: LimitClass::MonthlyHard,
            limit: 100.0,
            current: 100.0,
            requested: 1.0,
            remaining: 0.0,
        }
        .is_infrastructure());
    }
}
