//! Programmatic API credentials.
//!
//! The raw key is shown once at creation; only its SHA-256 hash and a short
//! non-secret prefix are stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tenant::NetworkRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Revoked,
    Expired,
}

/// Scope labels attached to a credential; each expands to a permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialScope {
    Read,
    Write,
    Voice,
    Analytics,
    Webhooks,
    Admin,
}

impl CredentialScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Voice => "voice",
            Self::Analytics => "analytics",
            Self::Webhooks => "webhooks",
            Self::Admin => "admin",
        }
    }
}

impl std::str::FromStr for CredentialScope {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "voice" => Ok(Self::Voice),
            "analytics" => Ok(Self::Analytics),
            "webhooks" => Ok(Self::Webhooks),
            "admin" => Ok(Self::Admin),
            other => Err(crate::error::Error::validation(
                "scope",
                format!("unknown scope '{other}'"),
            )),
        }
    }
}

/// Stored credential record. The raw key never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// SHA-256 hex digest of the raw key.
    pub key_hash: String,
    /// First characters of the raw key, for identification in listings.
    pub key_prefix: String,
    pub scopes: Vec<CredentialScope>,
    pub status: CredentialStatus,
    pub allowed_networks: Vec<NetworkRange>,
    pub rate_limit_per_hour: u32,
    pub rate_limit_per_day: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

impl ApiCredential {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == CredentialStatus::Active
            && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }

    pub fn allows_source(&self, addr: Option<std::net::IpAddr>) -> bool {
        if self.allowed_networks.is_empty() {
            return true;
        }
        match addr {
            Some(addr) => self.allowed_networks.iter().any(|n| n.contains(addr)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> ApiCredential {
        ApiCredential {
            id: "cred-1".into(),
            tenant_id: "t-1".into(),
            name: "ci".into(),
            key_hash: "00".repeat(32),
            key_prefix: "vg_live_abcd".into(),
            scopes: vec![CredentialScope::Read],
            status: CredentialStatus::Active,
            allowed_networks: vec![],
            rate_limit_per_hour: 1000,
            rate_limit_per_day: 10000,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
            rotated_at: None,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    #[test]
    fn active_unexpired_is_usable() {
        assert!(credential().is_usable(Utc::now()));
    }

    #[test]
    fn revoked_is_not_usable() {
        let mut c = credential();
        c.status = CredentialStatus::Revoked;
        assert!(!c.is_usable(Utc::now()));
    }

    #[test]
    fn expired_is_not_usable() {
        let mut c = credential();
        c.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!c.is_usable(Utc::now()));
    }
}
