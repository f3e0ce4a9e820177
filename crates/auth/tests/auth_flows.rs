//! Auth flows exercised end to end against in-memory stores.

use std::sync::Arc;

use voxgate_auth::{
    hash_password, perms, ApiKeyManager, LoginConfig, LoginService, ResolveInput, RoleTable,
    TenantResolver, TokenKeys, TokenService, TokenType,
};
use voxgate_core::{
    AuditKind, AuditOutcome, CredentialScope, Error, Principal, Role, Tenant, TenantStatus,
    TenantTier,
};
use voxgate_store::{
    InMemoryAuditStore, InMemoryCounterStore, InMemoryCredentialStore, InMemoryPrincipalStore,
    InMemoryTenantStore, PrincipalStore, TenantStore,
};

struct Harness {
    tokens: Arc<TokenService>,
    roles: RoleTable,
    resolver: TenantResolver,
    login: LoginService,
    api_keys: Arc<ApiKeyManager>,
    audit: Arc<InMemoryAuditStore>,
    tenant_id: String,
    principal_id: String,
}

async fn harness() -> Harness {
    let tenants = Arc::new(InMemoryTenantStore::new());
    let principals = Arc::new(InMemoryPrincipalStore::new());
    let audit = Arc::new(InMemoryAuditStore::new());
    let counters = Arc::new(InMemoryCounterStore::new());
    let roles = RoleTable::builtin();

    let tokens = Arc::new(TokenService::new(
        TokenKeys::hmac("integration-secret"),
        30,
        7,
        counters.clone(),
    ));
    let api_keys = Arc::new(ApiKeyManager::new(
        Arc::new(InMemoryCredentialStore::new()),
        counters.clone(),
        audit.clone(),
        true,
    ));

    let mut tenant = Tenant::new("acme", "Acme Realty", TenantTier::Professional).unwrap();
    tenant.status = TenantStatus::Active;
    let tenant_id = tenant.id.clone();
    tenants.upsert(&tenant).await.unwrap();

    let principal = Principal::new(
        &tenant_id,
        "agent@acme.test",
        "Agent",
        Role::AnalyticsViewer,
        hash_password("a-long-enough-password").unwrap(),
    );
    let principal_id = principal.id.clone();
    principals.upsert(&principal).await.unwrap();

    let resolver = TenantResolver::new(
        tenants.clone(),
        principals.clone(),
        audit.clone(),
        tokens.clone(),
        api_keys.clone(),
        roles.clone(),
    );
    let login = LoginService::new(
        tenants,
        principals,
        counters,
        audit.clone(),
        tokens.clone(),
        roles.clone(),
        LoginConfig::default(),
    );

    Harness {
        tokens,
        roles,
        resolver,
        login,
        api_keys,
        audit,
        tenant_id,
        principal_id,
    }
}

#[tokio::test]
async fn authenticated_but_underprivileged_is_denied_with_context() {
    // Scenario: a token holding {conversation:read, analytics:read}
    // requests voice_agent:update.
    let h = harness().await;
    let pair = h
        .login
        .login("acme", "agent@acme.test", "a-long-enough-password", None)
        .await
        .unwrap();

    let mut input = ResolveInput {
        path: "/api/v1/agents/ag-1".to_string(),
        ..Default::default()
    };
    input.bearer_token = Some(pair.access_token);
    let ctx = h.resolver.resolve(&input).await.unwrap();

    assert!(ctx.permissions.contains(&"analytics:read".to_string()));
    assert!(ctx.permissions.contains(&"conversation:read".to_string()));

    let check = h.roles.check(&ctx.permissions, perms::VOICE_AGENT_UPDATE);
    assert!(!check.allowed);
    assert_eq!(check.required, vec!["voice_agent:update"]);
    assert_eq!(check.held, *ctx.permissions);

    // The denial surfaces as unauthorized carrying both sides.
    let err = Error::Unauthorized {
        required: check.required[0].clone(),
        held: check.held,
    };
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn credential_rotation_invalidates_old_key_and_keeps_grants() {
    let h = harness().await;
    let first = h
        .api_keys
        .create(
            &h.tenant_id,
            "integration",
            vec![CredentialScope::Read, CredentialScope::Analytics],
            vec![],
            None,
            None,
            "corr-rotation",
        )
        .await
        .unwrap();

    // Validate C1 works.
    h.api_keys.validate(&first.raw_key, None).await.unwrap();

    let rotated = h
        .api_keys
        .rotate(&h.tenant_id, &first.credential.id, "corr-rotation")
        .await
        .unwrap();

    // C1 now fails as unauthenticated; C2 carries identical scopes.
    let err = h.api_keys.validate(&first.raw_key, None).await.unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));
    let validated = h.api_keys.validate(&rotated.raw_key, None).await.unwrap();
    assert_eq!(validated.scopes, first.credential.scopes);
    assert_eq!(validated.id, first.credential.id);

    // Exactly one rotation audit row.
    let rotations = h
        .audit
        .all_for_tenant(&h.tenant_id)
        .into_iter()
        .filter(|r| r.kind == AuditKind::CredentialRotated)
        .count();
    assert_eq!(rotations, 1);
}

#[tokio::test]
async fn revoked_token_is_dead_for_its_remaining_lifetime() {
    let h = harness().await;
    let pair = h
        .tokens
        .issue_pair(&h.tenant_id, &h.principal_id, vec!["conversation:read".into()])
        .unwrap();
    let claims = h
        .tokens
        .validate(&pair.access_token, TokenType::Access)
        .await
        .unwrap();

    h.tokens.revoke(&claims).await.unwrap();
    for _ in 0..5 {
        let err = h
            .tokens
            .validate(&pair.access_token, TokenType::Access)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }
}

#[tokio::test]
async fn expired_token_rejected_fresh_token_accepted() {
    let counters = Arc::new(InMemoryCounterStore::new());
    // Zero-minute access lifetime: issued already expired.
    let expired_issuer = TokenService::new(
        TokenKeys::hmac("integration-secret"),
        0,
        7,
        counters.clone(),
    );
    let pair = expired_issuer.issue_pair("t", "p", vec![]).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    assert!(expired_issuer
        .validate(&pair.access_token, TokenType::Access)
        .await
        .is_err());

    let fresh_issuer = TokenService::new(
        TokenKeys::hmac("integration-secret"),
        30,
        7,
        counters,
    );
    let pair = fresh_issuer.issue_pair("t", "p", vec![]).unwrap();
    assert!(fresh_issuer
        .validate(&pair.access_token, TokenType::Access)
        .await
        .is_ok());
}

#[tokio::test]
async fn failed_login_attempts_are_audited() {
    let h = harness().await;
    let _ = h
        .login
        .login("acme", "agent@acme.test", "wrong-password", None)
        .await;

    let failures: Vec<_> = h
        .audit
        .all_for_tenant(&h.tenant_id)
        .into_iter()
        .filter(|r| r.kind == AuditKind::LoginFailure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].outcome, AuditOutcome::Failure);
    assert_eq!(failures[0].details["reason"], "bad password");
}

#[tokio::test]
async fn api_key_auth_resolves_scoped_context() {
    let h = harness().await;
    let issued = h
        .api_keys
        .create(
            &h.tenant_id,
            "ci",
            vec![CredentialScope::Voice],
            vec![],
            None,
            None,
            "corr",
        )
        .await
        .unwrap();

    let input = ResolveInput {
        api_key: Some(issued.raw_key),
        path: "/api/v1/voice/synthesize".to_string(),
        ..Default::default()
    };
    let ctx = h.resolver.resolve(&input).await.unwrap();
    assert!(ctx.is_credential_auth());
    assert!(h
        .roles
        .check(&ctx.permissions, perms::VOICE_SESSION_SYNTHESIZE)
        .allowed);
    assert!(!h.roles.check(&ctx.permissions, perms::ADMIN_USERS).allowed);
}
