//! Append-only audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ApiCall,
    LoginSuccess,
    LoginFailure,
    TokenRevoked,
    LimitExceeded,
    LimitWarning,
    DataUpdate,
    CredentialRotated,
    SessionEvent,
    CounterUnavailable,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiCall => "api_call",
            Self::LoginSuccess => "login_success",
            Self::LoginFailure => "login_failure",
            Self::TokenRevoked => "token_revoked",
            Self::LimitExceeded => "limit_exceeded",
            Self::LimitWarning => "limit_warning",
            Self::DataUpdate => "data_update",
            Self::CredentialRotated => "credential_rotated",
            Self::SessionEvent => "session_event",
            Self::CounterUnavailable => "counter_unavailable",
        }
    }

    /// Security-classified kinds always receive the long retention floor.
    pub fn is_security_classified(&self) -> bool {
        matches!(
            self,
            Self::LoginSuccess
                | Self::LoginFailure
                | Self::TokenRevoked
                | Self::CredentialRotated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

/// Retention floor: 7 years for security/high-severity rows, 13 months otherwise.
pub const RETENTION_LONG_SECS: i64 = 7 * 365 * 24 * 3600;
pub const RETENTION_SHORT_SECS: i64 = 13 * 30 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub tenant_id: String,
    pub kind: AuditKind,
    pub severity: AuditSeverity,
    pub outcome: AuditOutcome,
    pub principal_id: Option<String>,
    pub source_network: Option<String>,
    /// Links sub-events of one request.
    pub correlation_id: String,
    pub action: String,
    pub details: serde_json::Value,
    /// Before/after snapshots, present for data-change kinds.
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        kind: AuditKind,
        severity: AuditSeverity,
        outcome: AuditOutcome,
        correlation_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            kind,
            severity,
            outcome,
            principal_id: None,
            source_network: None,
            correlation_id: correlation_id.into(),
            action: action.into(),
            details: serde_json::Value::Null,
            before: None,
            after: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    pub fn with_source(mut self, network: impl Into<String>) -> Self {
        self.source_network = Some(network.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_change(mut self, before: serde_json::Value, after: serde_json::Value) -> Self {
        self.before = Some(before);
        self.after = Some(after);
        self
    }

    pub fn retention_secs(&self) -> i64 {
        if self.kind.is_security_classified() || self.severity >= AuditSeverity::High {
            RETENTION_LONG_SECS
        } else {
            RETENTION_SHORT_SECS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_rows_get_long_retention() {
        let rec = AuditRecord::new(
            "t-1",
            AuditKind::LoginFailure,
            AuditSeverity::Info,
            AuditOutcome::Failure,
            "corr-1",
            "login",
        );
        assert_eq!(rec.retention_secs(), RETENTION_LONG_SECS);
    }

    #[test]
    fn high_severity_rows_get_long_retention() {
        let rec = AuditRecord::new(
            "t-1",
            AuditKind::ApiCall,
            AuditSeverity::Critical,
            AuditOutcome::Success,
            "corr-1",
            "delete_agent",
        );
        assert_eq!(rec.retention_secs(), RETENTION_LONG_SECS);
    }

    #[test]
    fn routine_rows_get_short_retention() {
        let rec = AuditRecord::new(
            "t-1",
            AuditKind::ApiCall,
            AuditSeverity::Info,
            AuditOutcome::Success,
            "corr-1",
            "list_sessions",
        );
        assert_eq!(rec.retention_secs(), RETENTION_SHORT_SECS);
    }
}
