//! Principals: human or programmatic identities bound to one tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed role set. Tenant-scoped roles are expanded to permission sets by
/// the permission evaluator; platform roles cross tenant boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    TenantAdmin,
    TenantManager,
    TenantUser,
    TenantViewer,
    VoiceAgentManager,
    AnalyticsViewer,
    ApiUser,
    SuperAdmin,
    PlatformAdmin,
    SupportAgent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TenantAdmin => "tenant_admin",
            Self::TenantManager => "tenant_manager",
            Self::TenantUser => "tenant_user",
            Self::TenantViewer => "tenant_viewer",
            Self::VoiceAgentManager => "voice_agent_manager",
            Self::AnalyticsViewer => "analytics_viewer",
            Self::ApiUser => "api_user",
            Self::SuperAdmin => "super_admin",
            Self::PlatformAdmin => "platform_admin",
            Self::SupportAgent => "support_agent",
        }
    }

    /// Platform roles are not scoped to a single tenant.
    pub fn is_platform_role(&self) -> bool {
        matches!(self, Self::SuperAdmin | Self::PlatformAdmin | Self::SupportAgent)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant_admin" => Ok(Self::TenantAdmin),
            "tenant_manager" => Ok(Self::TenantManager),
            "tenant_user" => Ok(Self::TenantUser),
            "tenant_viewer" => Ok(Self::TenantViewer),
            "voice_agent_manager" => Ok(Self::VoiceAgentManager),
            "analytics_viewer" => Ok(Self::AnalyticsViewer),
            "api_user" => Ok(Self::ApiUser),
            "super_admin" => Ok(Self::SuperAdmin),
            "platform_admin" => Ok(Self::PlatformAdmin),
            "support_agent" => Ok(Self::SupportAgent),
            other => Err(crate::error::Error::validation(
                "role",
                format!("unknown role '{other}'"),
            )),
        }
    }
}

/// An identity within exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    /// Extra grants beyond the role expansion, `resource:action` form.
    pub extra_permissions: Vec<String>,
    /// Argon2 PHC string; never serialized outward.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub mfa_enrolled: bool,
    pub active: bool,
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_network: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn new(
        tenant_id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            email: email.into(),
            display_name: display_name.into(),
            role,
            extra_permissions: Vec::new(),
            password_hash: password_hash.into(),
            mfa_enrolled: false,
            active: true,
            failed_login_attempts: 0,
            locked_until: None,
            last_login_at: None,
            last_login_network: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn record_failed_login(&mut self, max_attempts: u32, lockout: chrono::Duration) {
        self.failed_login_attempts += 1;
        if self.failed_login_attempts >= max_attempts {
            self.locked_until = Some(Utc::now() + lockout);
        }
    }

    pub fn record_successful_login(&mut self, source_network: Option<String>) {
        self.failed_login_attempts = 0;
        self.locked_until = None;
        self.last_login_at = Some(Utc::now());
        self.last_login_network = source_network;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockout_after_max_attempts() {
        let mut p = Principal::new("t-1", "a@acme.test", "A", Role::TenantUser, "hash");
        for _ in 0..4 {
            p.record_failed_login(5, chrono::Duration::minutes(15));
            assert!(!p.is_locked(Utc::now()));
        }
        p.record_failed_login(5, chrono::Duration::minutes(15));
        assert!(p.is_locked(Utc::now()));
    }

    #[test]
    fn successful_login_clears_lock_state() {
        let mut p = Principal::new("t-1", "a@acme.test", "A", Role::TenantUser, "hash");
        for _ in 0..5 {
            p.record_failed_login(5, chrono::Duration::minutes(15));
        }
        assert!(p.is_locked(Utc::now()));
        p.record_successful_login(Some("10.0.0.1".into()));
        assert!(!p.is_locked(Utc::now()));
        assert_eq!(p.failed_login_attempts, 0);
    }

    #[test]
    fn role_round_trip() {
        for role in [Role::TenantAdmin, Role::SuperAdmin, Role::ApiUser] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }
}
