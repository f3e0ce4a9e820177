//! Login, logout and refresh flows.
//!
//! Login attempts are rate limited per source network and per email
//! through TTL'd counter cells before any store lookup happens. Failed
//! attempts count toward the principal's lockout; every outcome leaves a
//! security audit row.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use voxgate_core::{
    AuditKind, AuditOutcome, AuditRecord, AuditSeverity, Error, Result, TenantStatus,
};
use voxgate_store::{keys, AuditStore, CounterStore, PrincipalStore, TenantStore};

use crate::password::verify_password;
use crate::permission::RoleTable;
use crate::token::{TokenPair, TokenService, TokenType};

#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub max_failed_logins: u32,
    pub lockout_minutes: i64,
    pub rate_limit_per_minute: u32,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_failed_logins: 5,
            lockout_minutes: 15,
            rate_limit_per_minute: 60,
        }
    }
}

pub struct LoginService {
    tenants: Arc<dyn TenantStore>,
    principals: Arc<dyn PrincipalStore>,
    counters: Arc<dyn CounterStore>,
    audit: Arc<dyn AuditStore>,
    tokens: Arc<TokenService>,
    roles: RoleTable,
    config: LoginConfig,
}

impl LoginService {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        principals: Arc<dyn PrincipalStore>,
        counters: Arc<dyn CounterStore>,
        audit: Arc<dyn AuditStore>,
        tokens: Arc<TokenService>,
        roles: RoleTable,
        config: LoginConfig,
    ) -> Self {
        Self {
            tenants,
            principals,
            counters,
            audit,
            tokens,
            roles,
            config,
        }
    }

    /// Authenticate with email + password against a tenant slug.
    pub async fn login(
        &self,
        tenant_slug: &str,
        email: &str,
        password: &str,
        source: Option<IpAddr>,
    ) -> Result<TokenPair> {
        let correlation_id = uuid::Uuid::new_v4().to_string();

        self.check_login_rate(source, email).await?;

        let tenant = self
            .tenants
            .get_by_slug(tenant_slug)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::Unauthenticated("invalid credentials".to_string()))?;

        if tenant.status != TenantStatus::Active {
            self.audit_failure(&tenant.id, email, "tenant not active", source, &correlation_id)
                .await;
            return Err(Error::Unauthenticated("invalid credentials".to_string()));
        }
        if !tenant.allows_source(source) {
            self.audit_failure(&tenant.id, email, "source denied", source, &correlation_id)
                .await;
            return Err(Error::Unauthenticated("invalid credentials".to_string()));
        }

        let mut principal = match self
            .principals
            .get_by_email(&tenant.id, email)
            .await
            .map_err(Error::from)?
        {
            Some(p) if p.active => p,
            _ => {
                self.bump_login_rate(source, email).await;
                self.audit_failure(&tenant.id, email, "unknown principal", source, &correlation_id)
                    .await;
                return Err(Error::Unauthenticated("invalid credentials".to_string()));
            }
        };

        if principal.is_locked(Utc::now()) {
            self.audit_failure(&tenant.id, email, "account locked", source, &correlation_id)
                .await;
            return Err(Error::Unauthenticated("account locked".to_string()));
        }

        if !verify_password(password, &principal.password_hash) {
            principal.record_failed_login(
                self.config.max_failed_logins,
                chrono::Duration::minutes(self.config.lockout_minutes),
            );
            self.principals.upsert(&principal).await.map_err(Error::from)?;
            self.bump_login_rate(source, email).await;
            self.audit_failure(&tenant.id, email, "bad password", source, &correlation_id)
                .await;
            return Err(Error::Unauthenticated("invalid credentials".to_string()));
        }

        principal.record_successful_login(source.map(|a| a.to_string()));
        self.principals.upsert(&principal).await.map_err(Error::from)?;

        let permissions = self
            .roles
            .permissions_for(principal.role, &principal.extra_permissions);
        let pair = self.tokens.issue_pair(&tenant.id, &principal.id, permissions)?;

        let record = AuditRecord::new(
            &tenant.id,
            AuditKind::LoginSuccess,
            AuditSeverity::Info,
            AuditOutcome::Success,
            &correlation_id,
            "login",
        )
        .with_principal(&principal.id)
        .with_source(source.map(|a| a.to_string()).unwrap_or_default());
        if let Err(e) = self.audit.append(&record).await {
            tracing::warn!(error = %e, "login audit write failed");
        }

        tracing::info!(tenant_id = %tenant.id, principal_id = %principal.id, "login succeeded");
        Ok(pair)
    }

    /// Exchange a refresh token for a new access token with the
    /// principal's current permission snapshot.
    pub async fn refresh(&self, refresh_token: &str) -> Result<(String, chrono::DateTime<Utc>)> {
        let claims = self
            .tokens
            .validate(refresh_token, TokenType::Refresh)
            .await?;
        let principal = self
            .principals
            .get(&claims.tenant_id, &claims.principal_id)
            .await
            .map_err(Error::from)?
            .filter(|p| p.active)
            .ok_or_else(|| Error::Unauthenticated("principal no longer active".to_string()))?;
        let permissions = self
            .roles
            .permissions_for(principal.role, &principal.extra_permissions);
        self.tokens.refresh(refresh_token, permissions).await
    }

    /// Explicit logout: revoke both tokens of the pair.
    pub async fn logout(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        let claims = self.tokens.validate(access_token, TokenType::Access).await?;
        self.tokens.revoke(&claims).await?;

        if let Some(refresh) = refresh_token {
            if let Ok(refresh_claims) = self.tokens.validate(refresh, TokenType::Refresh).await {
                self.tokens.revoke(&refresh_claims).await?;
            }
        }

        let record = AuditRecord::new(
            &claims.tenant_id,
            AuditKind::TokenRevoked,
            AuditSeverity::Info,
            AuditOutcome::Success,
            uuid::Uuid::new_v4().to_string(),
            "logout",
        )
        .with_principal(&claims.principal_id);
        if let Err(e) = self.audit.append(&record).await {
            tracing::warn!(error = %e, "logout audit write failed");
        }
        Ok(())
    }

    async fn check_login_rate(&self, source: Option<IpAddr>, email: &str) -> Result<()> {
        let mut rate_keys = vec![keys::rate_limit("login_email", email)];
        if let Some(addr) = source {
            rate_keys.push(keys::rate_limit("login_ip", &addr.to_string()));
        }
        // Counter outage fails open: login availability beats rate limits.
        let counts = match self.counters.multi_get(&rate_keys).await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "counter store down, skipping login rate limit");
                return Ok(());
            }
        };
        for count in counts.into_iter().flatten() {
            if count >= self.config.rate_limit_per_minute as f64 {
                return Err(Error::RateLimit {
                    retry_after_secs: 60,
                });
            }
        }
        Ok(())
    }

    async fn bump_login_rate(&self, source: Option<IpAddr>, email: &str) {
        let mut rate_keys = vec![keys::rate_limit("login_email", email)];
        if let Some(addr) = source {
            rate_keys.push(keys::rate_limit("login_ip", &addr.to_string()));
        }
        for key in rate_keys {
            if let Ok(count) = self.counters.incr_by_float(&key, 1.0).await {
                if count == 1.0 {
                    let _ = self.counters.expire(&key, Duration::from_secs(60)).await;
                }
            }
        }
    }

    async fn audit_failure(
        &self,
        tenant_id: &str,
        email: &str,
        reason: &str,
        source: Option<IpAddr>,
        correlation_id: &str,
    ) {
        let record = AuditRecord::new(
            tenant_id,
            AuditKind::LoginFailure,
            AuditSeverity::Medium,
            AuditOutcome::Failure,
            correlation_id,
            "login",
        )
        .with_source(source.map(|a| a.to_string()).unwrap_or_default())
        .with_details(serde_json::json!({ "email": email, "reason": reason }));
        if let Err(e) = self.audit.append(&record).await {
            tracing::warn!(error = %e, "login failure audit write failed");
        }
    }
}
