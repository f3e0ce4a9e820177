//! API key lifecycle: create, validate, rotate, revoke.
//!
//! Raw keys look like `vg_live_<40 hex>` and are returned exactly once;
//! storage keeps the SHA-256 hash plus a short prefix for listings.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

use voxgate_core::{
    ApiCredential, AuditKind, AuditOutcome, AuditRecord, AuditSeverity, CredentialScope,
    CredentialStatus, Error, NetworkRange, Result,
};
use voxgate_store::{keys, AuditStore, CounterStore, CredentialStore};

use crate::permission::perms;

const KEY_PREFIX_LEN: usize = 12;
const DEFAULT_RATE_PER_HOUR: u32 = 1_000;
const DEFAULT_RATE_PER_DAY: u32 = 10_000;

/// Expand credential scopes to permission strings.
pub fn scope_permissions(scopes: &[CredentialScope]) -> Vec<String> {
    let mut permissions = Vec::new();
    for scope in scopes {
        let granted: &[&str] = match scope {
            CredentialScope::Read => &[
                perms::CONVERSATION_READ,
                perms::CONVERSATION_LIST,
                perms::LEAD_READ,
                perms::VOICE_AGENT_READ,
                perms::API_READ,
            ],
            CredentialScope::Write => &[
                perms::LEAD_CREATE,
                perms::LEAD_UPDATE,
                perms::VOICE_AGENT_UPDATE,
                perms::API_WRITE,
            ],
            CredentialScope::Voice => &[
                perms::VOICE_SESSION_START,
                perms::VOICE_SESSION_SYNTHESIZE,
                perms::VOICE_AGENT_READ,
            ],
            CredentialScope::Analytics => &[perms::ANALYTICS_READ, perms::ANALYTICS_EXPORT],
            CredentialScope::Webhooks => &[
                perms::WEBHOOK_CREATE,
                perms::WEBHOOK_READ,
                perms::WEBHOOK_UPDATE,
                perms::WEBHOOK_TEST,
            ],
            CredentialScope::Admin => &[
                perms::API_KEYS_MANAGE,
                perms::ADMIN_USERS,
                perms::ADMIN_BILLING,
                perms::ADMIN_AUDIT,
            ],
        };
        permissions.extend(granted.iter().map(|s| s.to_string()));
    }
    permissions.sort();
    permissions.dedup();
    permissions
}

pub fn hash_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn generate_raw_key(live: bool) -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    let env = if live { "live" } else { "test" };
    format!("vg_{env}_{}", hex::encode(bytes))
}

pub struct ApiKeyManager {
    credentials: Arc<dyn CredentialStore>,
    counters: Arc<dyn CounterStore>,
    audit: Arc<dyn AuditStore>,
    live_mode: bool,
}

/// A freshly created or rotated key: the only moment the raw value exists.
#[derive(Debug)]
pub struct IssuedKey {
    pub credential: ApiCredential,
    pub raw_key: String,
}

impl ApiKeyManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        counters: Arc<dyn CounterStore>,
        audit: Arc<dyn AuditStore>,
        live_mode: bool,
    ) -> Self {
        Self {
            credentials,
            counters,
            audit,
            live_mode,
        }
    }

    /// Create a credential; the raw key is returned once and never stored.
    pub async fn create(
        &self,
        tenant_id: &str,
        name: &str,
        scopes: Vec<CredentialScope>,
        allowed_networks: Vec<NetworkRange>,
        rate_limit_per_hour: Option<u32>,
        rate_limit_per_day: Option<u32>,
        correlation_id: &str,
    ) -> Result<IssuedKey> {
        if scopes.is_empty() {
            return Err(Error::validation("scopes", "at least one scope is required"));
        }

        let raw_key = generate_raw_key(self.live_mode);
        let credential = ApiCredential {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            key_hash: hash_key(&raw_key),
            key_prefix: raw_key[..KEY_PREFIX_LEN].to_string(),
            scopes,
            status: CredentialStatus::Active,
            allowed_networks,
            rate_limit_per_hour: rate_limit_per_hour.unwrap_or(DEFAULT_RATE_PER_HOUR),
            rate_limit_per_day: rate_limit_per_day.unwrap_or(DEFAULT_RATE_PER_DAY),
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
            rotated_at: None,
            revoked_at: None,
            revocation_reason: None,
        };

        self.credentials.upsert(&credential).await.map_err(Error::from)?;
        self.audit
            .append(
                &AuditRecord::new(
                    tenant_id,
                    AuditKind::DataUpdate,
                    AuditSeverity::Medium,
                    AuditOutcome::Success,
                    correlation_id,
                    "api_key_created",
                )
                .with_details(serde_json::json!({
                    "credential_id": credential.id.clone(),
                    "key_prefix": credential.key_prefix.clone(),
                })),
            )
            .await
            .map_err(Error::from)?;

        tracing::info!(
            tenant_id = %tenant_id,
            credential_id = %credential.id,
            prefix = %credential.key_prefix,
            "api key created"
        );
        Ok(IssuedKey { credential, raw_key })
    }

    /// Validate a raw key: hash lookup, status, expiry, source network,
    /// then the credential's own rate limits.
    pub async fn validate(
        &self,
        raw_key: &str,
        source: Option<std::net::IpAddr>,
    ) -> Result<ApiCredential> {
        let credential = self
            .credentials
            .get_by_hash(&hash_key(raw_key))
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::Unauthenticated("unknown api key".to_string()))?;

        if !credential.is_usable(Utc::now()) {
            return Err(Error::Unauthenticated("api key inactive".to_string()));
        }
        if !credential.allows_source(source) {
            return Err(Error::Unauthenticated(
                "source address not permitted for this key".to_string(),
            ));
        }

        self.check_rate_limits(&credential).await?;

        let mut touched = credential.clone();
        touched.last_used_at = Some(Utc::now());
        // Usage timestamp is best-effort; validation already succeeded.
        if let Err(e) = self.credentials.upsert(&touched).await {
            tracing::debug!(error = %e, "failed to update key last_used_at");
        }

        Ok(credential)
    }

    async fn check_rate_limits(&self, credential: &ApiCredential) -> Result<()> {
        let hour_key = keys::rate_limit("apikey_hour", &credential.id);
        let day_key = keys::rate_limit("apikey_day", &credential.id);

        // Counter store outages fail open for key rate limits.
        let hourly = match self.counters.incr_by_float(&hour_key, 1.0).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "counter store down, skipping key rate limits");
                return Ok(());
            }
        };
        if hourly == 1.0 {
            let _ = self
                .counters
                .expire(&hour_key, Duration::from_secs(3600))
                .await;
        }
        if hourly > credential.rate_limit_per_hour as f64 {
            return Err(Error::RateLimit {
                retry_after_secs: 3600,
            });
        }

        let daily = self
            .counters
            .incr_by_float(&day_key, 1.0)
            .await
            .unwrap_or(0.0);
        if daily == 1.0 {
            let _ = self
                .counters
                .expire(&day_key, Duration::from_secs(86_400))
                .await;
        }
        if daily > credential.rate_limit_per_day as f64 {
            return Err(Error::RateLimit {
                retry_after_secs: 86_400,
            });
        }
        Ok(())
    }

    /// Rotate: replace the hash in place; the old raw value dies now.
    /// Scopes, networks and limits carry over unchanged.
    pub async fn rotate(
        &self,
        tenant_id: &str,
        credential_id: &str,
        correlation_id: &str,
    ) -> Result<IssuedKey> {
        let existing = self
            .credentials
            .get(tenant_id, credential_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("api_credential"))?;

        if existing.status != CredentialStatus::Active {
            return Err(Error::business_rule(
                "credential_rotate",
                "only active credentials can be rotated",
            ));
        }

        let raw_key = generate_raw_key(self.live_mode);
        let old_hash = existing.key_hash.clone();
        let mut rotated = existing;
        rotated.key_hash = hash_key(&raw_key);
        rotated.key_prefix = raw_key[..KEY_PREFIX_LEN].to_string();
        rotated.rotated_at = Some(Utc::now());

        self.credentials.upsert(&rotated).await.map_err(Error::from)?;
        self.credentials
            .remove_hash(&old_hash)
            .await
            .map_err(Error::from)?;

        self.audit
            .append(
                &AuditRecord::new(
                    tenant_id,
                    AuditKind::CredentialRotated,
                    AuditSeverity::Medium,
                    AuditOutcome::Success,
                    correlation_id,
                    "api_key_rotated",
                )
                .with_details(serde_json::json!({
                    "credential_id": rotated.id.clone(),
                    "key_prefix": rotated.key_prefix.clone(),
                })),
            )
            .await
            .map_err(Error::from)?;

        tracing::info!(
            tenant_id = %tenant_id,
            credential_id = %rotated.id,
            "api key rotated"
        );
        Ok(IssuedKey {
            credential: rotated,
            raw_key,
        })
    }

    pub async fn revoke(
        &self,
        tenant_id: &str,
        credential_id: &str,
        reason: &str,
        correlation_id: &str,
    ) -> Result<()> {
        let mut credential = self
            .credentials
            .get(tenant_id, credential_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("api_credential"))?;

        credential.status = CredentialStatus::Revoked;
        credential.revoked_at = Some(Utc::now());
        credential.revocation_reason = Some(reason.to_string());
        self.credentials.upsert(&credential).await.map_err(Error::from)?;

        self.audit
            .append(
                &AuditRecord::new(
                    tenant_id,
                    AuditKind::DataUpdate,
                    AuditSeverity::Medium,
                    AuditOutcome::Success,
                    correlation_id,
                    "api_key_revoked",
                )
                .with_details(serde_json::json!({
                    "credential_id": credential.id.clone(),
                    "reason": reason,
                })),
            )
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}
