//! Tenant identity, lifecycle, and network gating.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tenant lifecycle status. Termination is terminal; suspension is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Pending,
    Provisioning,
    Active,
    Suspended,
    Terminated,
    Error,
}

impl TenantStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: TenantStatus) -> bool {
        use TenantStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (Pending, Provisioning) | (Pending, Error) => true,
            (Provisioning, Active) | (Provisioning, Error) => true,
            (Active, Suspended) | (Active, Terminated) => true,
            (Suspended, Active) | (Suspended, Terminated) => true,
            (Error, Provisioning) | (Error, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Subscription tier selecting quota tables, pricing and feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    #[default]
    Starter,
    Professional,
    Enterprise,
    Custom,
}

impl std::fmt::Display for TenantTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starter => "starter",
            Self::Professional => "professional",
            Self::Enterprise => "enterprise",
            Self::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TenantTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starter" => Ok(Self::Starter),
            "professional" => Ok(Self::Professional),
            "enterprise" => Ok(Self::Enterprise),
            "custom" => Ok(Self::Custom),
            other => Err(Error::validation("tier", format!("unknown tier '{other}'"))),
        }
    }
}

/// An IPv4/IPv6 network in CIDR form used for tenant allow-lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkRange(pub String);

impl NetworkRange {
    /// Parse and check membership. Bare addresses are treated as /32 (/128).
    pub fn contains(&self, addr: IpAddr) -> bool {
        let (net, bits) = match self.0.split_once('/') {
            Some((net, bits)) => match (net.parse::<IpAddr>(), bits.parse::<u8>()) {
                (Ok(n), Ok(b)) => (n, b),
                _ => return false,
            },
            None => match self.0.parse::<IpAddr>() {
                Ok(n) => (n, if n.is_ipv4() { 32 } else { 128 }),
                Err(_) => return false,
            },
        };

        match (net, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let bits = bits.min(32);
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let bits = bits.min(128);
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

/// A customer of the platform. All scoped data hangs off `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub tier: TenantTier,
    /// Empty list means any source network is accepted.
    pub allowed_networks: Vec<NetworkRange>,
    pub maintenance_mode: bool,
    /// ISO 4217 currency for all monetary amounts of this tenant.
    pub currency: String,
    /// Fractional discount applied at invoicing, e.g. 0.10 for 10%.
    pub discount_rate: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(slug: impl Into<String>, name: impl Into<String>, tier: TenantTier) -> Result<Self> {
        let slug = slug.into();
        validate_slug(&slug)?;
        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            slug,
            name: name.into(),
            status: TenantStatus::Pending,
            tier,
            allowed_networks: Vec::new(),
            maintenance_mode: false,
            currency: "USD".to_string(),
            discount_rate: 0.0,
            created_at: now,
            updated_at: now,
        })
    }

    /// An empty allow-list admits any address.
    pub fn allows_source(&self, addr: Option<IpAddr>) -> bool {
        if self.allowed_networks.is_empty() {
            return true;
        }
        match addr {
            Some(addr) => self.allowed_networks.iter().any(|n| n.contains(addr)),
            None => false,
        }
    }

    pub fn transition(&mut self, next: TenantStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::business_rule(
                "tenant_status_transition",
                format!("cannot move tenant from {} to {}", self.status, next),
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Slug rules: lowercase alphanumeric and hyphen, 3–50 chars, no edge hyphens.
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.len() < 3 || slug.len() > 50 {
        return Err(Error::validation("slug", "must be 3-50 characters"));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::validation(
            "slug",
            "must contain only lowercase letters, digits, and hyphens",
        ));
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(Error::validation("slug", "must not begin or end with a hyphen"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_validation() {
        assert!(validate_slug("acme").is_ok());
        assert!(validate_slug("acme-west-2").is_ok());
        assert!(validate_slug("ab").is_err());
        assert!(validate_slug("Acme").is_err());
        assert!(validate_slug("-acme").is_err());
        assert!(validate_slug("acme_west").is_err());
        assert!(validate_slug(&"a".repeat(51)).is_err());
    }

    #[test]
    fn status_transitions() {
        assert!(TenantStatus::Pending.can_transition_to(TenantStatus::Provisioning));
        assert!(TenantStatus::Provisioning.can_transition_to(TenantStatus::Active));
        assert!(TenantStatus::Active.can_transition_to(TenantStatus::Suspended));
        assert!(TenantStatus::Suspended.can_transition_to(TenantStatus::Active));
        assert!(!TenantStatus::Terminated.can_transition_to(TenantStatus::Active));
        assert!(!TenantStatus::Pending.can_transition_to(TenantStatus::Active));
    }

    #[test]
    fn network_range_membership() {
        let range = NetworkRange("10.0.0.0/8".to_string());
        assert!(range.contains("10.1.2.3".parse().unwrap()));
        assert!(!range.contains("11.0.0.1".parse().unwrap()));

        let single = NetworkRange("192.168.1.5".to_string());
        assert!(single.contains("192.168.1.5".parse().unwrap()));
        assert!(!single.contains("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn empty_allowlist_admits_all() {
        let tenant = Tenant::new("acme", "Acme Corp", TenantTier::Starter).unwrap();
        assert!(tenant.allows_source(Some("203.0.113.7".parse().unwrap())));
        assert!(tenant.allows_source(None));
    }

    #[test]
    fn allowlist_denies_unknown_source() {
        let mut tenant = Tenant::new("acme", "Acme Corp", TenantTier::Starter).unwrap();
        tenant.allowed_networks = vec![NetworkRange("10.0.0.0/8".into())];
        assert!(tenant.allows_source(Some("10.9.9.9".parse().unwrap())));
        assert!(!tenant.allows_source(Some("203.0.113.7".parse().unwrap())));
        assert!(!tenant.allows_source(None));
    }
}
