//! Tenant resolution: every non-public request passes through here once.
//!
//! Resolution order: bearer session token → API credential → tenant slug
//! (hostname subdomain, `/t/<slug>` path prefix, or explicit header). The
//! resolver owns the status/network/maintenance gates and emits the
//! per-request `api_call` audit row; downstream handlers receive a scoped
//! [`RequestContext`] and never touch credentials themselves.

use std::net::IpAddr;
use std::sync::Arc;

use voxgate_core::{
    AuditKind, AuditOutcome, AuditRecord, AuditSeverity, AuthMethod, Error, RequestContext,
    Result, Tenant, TenantStatus,
};
use voxgate_store::{AuditStore, PrincipalStore, TenantStore};

use crate::apikey::{scope_permissions, ApiKeyManager};
use crate::permission::RoleTable;
use crate::token::{TokenService, TokenType};

/// Raw request attributes the resolver works from.
#[derive(Debug, Clone, Default)]
pub struct ResolveInput {
    pub bearer_token: Option<String>,
    pub api_key: Option<String>,
    pub host: Option<String>,
    pub tenant_header: Option<String>,
    pub path: String,
    pub source_addr: Option<IpAddr>,
}

/// Paths probed by orchestration; never audited.
pub fn is_health_path(path: &str) -> bool {
    matches!(path, "/health" | "/ready" | "/metrics")
}

/// Extract a tenant slug from `acme.api.example.com` style hosts.
fn slug_from_host(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let mut parts = host.split('.');
    let first = parts.next()?;
    // Need at least a three-label host for a subdomain slug.
    if parts.clone().count() >= 2 && first != "www" && first != "api" {
        Some(first.to_string())
    } else {
        None
    }
}

/// Extract a tenant slug from a `/t/<slug>/...` path prefix.
fn slug_from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/t/")?;
    let slug = rest.split('/').next()?;
    (!slug.is_empty()).then(|| slug.to_string())
}

pub struct TenantResolver {
    tenants: Arc<dyn TenantStore>,
    principals: Arc<dyn PrincipalStore>,
    audit: Arc<dyn AuditStore>,
    tokens: Arc<TokenService>,
    api_keys: Arc<ApiKeyManager>,
    roles: RoleTable,
}

impl TenantResolver {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        principals: Arc<dyn PrincipalStore>,
        audit: Arc<dyn AuditStore>,
        tokens: Arc<TokenService>,
        api_keys: Arc<ApiKeyManager>,
        roles: RoleTable,
    ) -> Self {
        Self {
            tenants,
            principals,
            audit,
            tokens,
            api_keys,
            roles,
        }
    }

    /// Resolve tenant and principal, enforce the gates, and audit.
    pub async fn resolve(&self, input: &ResolveInput) -> Result<RequestContext> {
        let correlation_id = uuid::Uuid::new_v4().to_string();

        let ctx = if let Some(token) = &input.bearer_token {
            self.resolve_bearer(token, input, &correlation_id).await?
        } else if let Some(key) = &input.api_key {
            self.resolve_api_key(key, input, &correlation_id).await?
        } else if let Some(slug) = self.extract_slug(input) {
            self.resolve_slug(&slug, input, &correlation_id).await?
        } else {
            return Err(Error::Unauthenticated(
                "no credentials or tenant identification supplied".to_string(),
            ));
        };

        if !is_health_path(&input.path) {
            let record = AuditRecord::new(
                &ctx.tenant_id,
                AuditKind::ApiCall,
                AuditSeverity::Info,
                AuditOutcome::Success,
                &ctx.correlation_id,
                &input.path,
            )
            .with_source(ctx.source_network().unwrap_or_default());
            let record = match &ctx.principal_id {
                Some(principal) => record.with_principal(principal),
                None => record,
            };
            // Request handling proceeds even if the audit write lags.
            if let Err(e) = self.audit.append(&record).await {
                tracing::warn!(error = %e, "api_call audit write failed");
            }
        }

        Ok(ctx)
    }

    fn extract_slug(&self, input: &ResolveInput) -> Option<String> {
        input
            .tenant_header
            .clone()
            .or_else(|| slug_from_path(&input.path))
            .or_else(|| input.host.as_deref().and_then(slug_from_host))
    }

    async fn load_gated_tenant(
        &self,
        tenant_id: Option<&str>,
        slug: Option<&str>,
        source: Option<IpAddr>,
    ) -> Result<Tenant> {
        let tenant = match (tenant_id, slug) {
            (Some(id), _) => self.tenants.get(id).await.map_err(Error::from)?,
            (None, Some(slug)) => self.tenants.get_by_slug(slug).await.map_err(Error::from)?,
            (None, None) => None,
        }
        .ok_or_else(|| Error::not_found("tenant"))?;

        // Gate order: status, then source network, then maintenance.
        if tenant.status != TenantStatus::Active {
            return Err(Error::Unauthenticated(format!(
                "tenant is {}",
                tenant.status
            )));
        }
        if !tenant.allows_source(source) {
            return Err(Error::Unauthenticated(
                "source network not permitted for this tenant".to_string(),
            ));
        }
        if tenant.maintenance_mode {
            return Err(Error::business_rule(
                "tenant_maintenance",
                "tenant is in maintenance mode",
            ));
        }
        Ok(tenant)
    }

    async fn resolve_bearer(
        &self,
        token: &str,
        input: &ResolveInput,
        correlation_id: &str,
    ) -> Result<RequestContext> {
        let claims = self.tokens.validate(token, TokenType::Access).await?;
        let tenant = self
            .load_gated_tenant(Some(&claims.tenant_id), None, input.source_addr)
            .await?;

        Ok(RequestContext {
            tenant_id: tenant.id,
            tenant_slug: tenant.slug,
            tier: tenant.tier,
            principal_id: Some(claims.principal_id),
            permissions: Arc::new(claims.permissions),
            source_addr: input.source_addr,
            correlation_id: correlation_id.to_string(),
            auth_method: AuthMethod::SessionToken,
        })
    }

    async fn resolve_api_key(
        &self,
        key: &str,
        input: &ResolveInput,
        correlation_id: &str,
    ) -> Result<RequestContext> {
        let credential = self.api_keys.validate(key, input.source_addr).await?;
        let tenant = self
            .load_gated_tenant(Some(&credential.tenant_id), None, input.source_addr)
            .await?;

        Ok(RequestContext {
            tenant_id: tenant.id,
            tenant_slug: tenant.slug,
            tier: tenant.tier,
            principal_id: None,
            permissions: Arc::new(scope_permissions(&credential.scopes)),
            source_addr: input.source_addr,
            correlation_id: correlation_id.to_string(),
            auth_method: AuthMethod::ApiCredential,
        })
    }

    /// Slug-only resolution: tenant scope without a principal. Used by
    /// the unauthenticated surface (login) and public assets.
    async fn resolve_slug(
        &self,
        slug: &str,
        input: &ResolveInput,
        correlation_id: &str,
    ) -> Result<RequestContext> {
        let tenant = self
            .load_gated_tenant(None, Some(slug), input.source_addr)
            .await?;

        Ok(RequestContext {
            tenant_id: tenant.id,
            tenant_slug: tenant.slug,
            tier: tenant.tier,
            principal_id: None,
            permissions: Arc::new(Vec::new()),
            source_addr: input.source_addr,
            correlation_id: correlation_id.to_string(),
            auth_method: AuthMethod::SlugOnly,
        })
    }

    /// Current permission snapshot for a principal; used at refresh time.
    pub async fn current_permissions(
        &self,
        tenant_id: &str,
        principal_id: &str,
    ) -> Result<Vec<String>> {
        let principal = self
            .principals
            .get(tenant_id, principal_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("principal"))?;
        Ok(self
            .roles
            .permissions_for(principal.role, &principal.extra_permissions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxgate_core::{NetworkRange, Principal, Role, TenantTier};
    use voxgate_store::{
        InMemoryAuditStore, InMemoryCounterStore, InMemoryCredentialStore, InMemoryPrincipalStore,
        InMemoryTenantStore,
    };

    struct Fixture {
        resolver: TenantResolver,
        tokens: Arc<TokenService>,
        api_keys: Arc<ApiKeyManager>,
        tenants: Arc<InMemoryTenantStore>,
        audit: Arc<InMemoryAuditStore>,
    }

    async fn fixture() -> Fixture {
        let tenants = Arc::new(InMemoryTenantStore::new());
        let principals = Arc::new(InMemoryPrincipalStore::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let counters = Arc::new(InMemoryCounterStore::new());
        let tokens = Arc::new(TokenService::new(
            crate::token::TokenKeys::hmac("test"),
            30,
            7,
            counters.clone(),
        ));
        let api_keys = Arc::new(ApiKeyManager::new(
            Arc::new(InMemoryCredentialStore::new()),
            counters,
            audit.clone(),
            true,
        ));
        let resolver = TenantResolver::new(
            tenants.clone(),
            principals.clone(),
            audit.clone(),
            tokens.clone(),
            api_keys.clone(),
            RoleTable::builtin(),
        );

        let mut tenant = Tenant::new("acme", "Acme", TenantTier::Professional).unwrap();
        tenant.id = "t-1".to_string();
        tenant.status = TenantStatus::Active;
        tenants.upsert(&tenant).await.unwrap();

        let principal = Principal::new("t-1", "a@acme.test", "A", Role::TenantUser, "hash");
        principals.upsert(&principal).await.unwrap();

        Fixture {
            resolver,
            tokens,
            api_keys,
            tenants,
            audit,
        }
    }

    fn input(path: &str) -> ResolveInput {
        ResolveInput {
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bearer_token_resolution() {
        let f = fixture().await;
        let pair = f
            .tokens
            .issue_pair("t-1", "p-1", vec!["conversation:read".into()])
            .unwrap();
        let mut inp = input("/api/v1/sessions");
        inp.bearer_token = Some(pair.access_token);

        let ctx = f.resolver.resolve(&inp).await.unwrap();
        assert_eq!(ctx.tenant_id, "t-1");
        assert_eq!(ctx.auth_method, AuthMethod::SessionToken);
        assert_eq!(ctx.principal_id.as_deref(), Some("p-1"));
        assert_eq!(ctx.tier, TenantTier::Professional);

        // One api_call audit row was written.
        let audits = f.audit.all_for_tenant("t-1");
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].kind, AuditKind::ApiCall);
    }

    #[tokio::test]
    async fn api_key_resolution_carries_scope_permissions() {
        let f = fixture().await;
        let issued = f
            .api_keys
            .create(
                "t-1",
                "ci",
                vec![voxgate_core::CredentialScope::Voice],
                vec![],
                None,
                None,
                "corr",
            )
            .await
            .unwrap();
        let mut inp = input("/api/v1/voice/synthesize");
        inp.api_key = Some(issued.raw_key);

        let ctx = f.resolver.resolve(&inp).await.unwrap();
        assert_eq!(ctx.auth_method, AuthMethod::ApiCredential);
        assert!(ctx
            .permissions
            .contains(&"voice_session:synthesize".to_string()));
        assert!(ctx.principal_id.is_none());
    }

    #[tokio::test]
    async fn slug_resolution_from_header_and_host_and_path() {
        let f = fixture().await;

        let mut inp = input("/api/v1/auth/login");
        inp.tenant_header = Some("acme".into());
        assert_eq!(f.resolver.resolve(&inp).await.unwrap().tenant_slug, "acme");

        let mut inp = input("/api/v1/auth/login");
        inp.host = Some("acme.voxgate.io".into());
        assert_eq!(f.resolver.resolve(&inp).await.unwrap().tenant_slug, "acme");

        let inp = input("/t/acme/login");
        assert_eq!(f.resolver.resolve(&inp).await.unwrap().tenant_slug, "acme");
    }

    #[tokio::test]
    async fn inactive_tenant_is_gated() {
        let f = fixture().await;
        let mut tenant = f.tenants.get("t-1").await.unwrap().unwrap();
        tenant.status = TenantStatus::Suspended;
        f.tenants.upsert(&tenant).await.unwrap();

        let mut inp = input("/api/v1/auth/login");
        inp.tenant_header = Some("acme".into());
        assert!(f.resolver.resolve(&inp).await.is_err());
    }

    #[tokio::test]
    async fn ip_allowlist_is_enforced() {
        let f = fixture().await;
        let mut tenant = f.tenants.get("t-1").await.unwrap().unwrap();
        tenant.allowed_networks = vec![NetworkRange("10.0.0.0/8".into())];
        f.tenants.upsert(&tenant).await.unwrap();

        let mut inp = input("/api/v1/auth/login");
        inp.tenant_header = Some("acme".into());
        inp.source_addr = Some("203.0.113.9".parse().unwrap());
        assert!(f.resolver.resolve(&inp).await.is_err());

        inp.source_addr = Some("10.1.2.3".parse().unwrap());
        assert!(f.resolver.resolve(&inp).await.is_ok());
    }

    #[tokio::test]
    async fn maintenance_mode_rejects() {
        let f = fixture().await;
        let mut tenant = f.tenants.get("t-1").await.unwrap().unwrap();
        tenant.maintenance_mode = true;
        f.tenants.upsert(&tenant).await.unwrap();

        let mut inp = input("/api/v1/auth/login");
        inp.tenant_header = Some("acme".into());
        let err = f.resolver.resolve(&inp).await.unwrap_err();
        assert!(matches!(err, Error::BusinessRule { .. }));
    }

    #[tokio::test]
    async fn health_paths_are_never_audited() {
        let f = fixture().await;
        let mut inp = input("/health");
        inp.tenant_header = Some("acme".into());
        f.resolver.resolve(&inp).await.unwrap();
        assert!(f.audit.all_for_tenant("t-1").is_empty());
    }
}
