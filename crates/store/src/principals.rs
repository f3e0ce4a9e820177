//! Principal persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use voxgate_core::{Principal, Role};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Principal>>;
    async fn get_by_email(&self, tenant_id: &str, email: &str) -> StoreResult<Option<Principal>>;
    async fn upsert(&self, principal: &Principal) -> StoreResult<()>;
}

#[derive(Default)]
pub struct InMemoryPrincipalStore {
    // Keyed by (tenant_id, email); one principal per email per tenant.
    by_email: RwLock<HashMap<(String, String), Principal>>,
}

impl InMemoryPrincipalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrincipalStore for InMemoryPrincipalStore {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Principal>> {
        Ok(self
            .by_email
            .read()
            .values()
            .find(|p| p.tenant_id == tenant_id && p.id == id)
            .cloned())
    }

    async fn get_by_email(&self, tenant_id: &str, email: &str) -> StoreResult<Option<Principal>> {
        Ok(self
            .by_email
            .read()
            .get(&(tenant_id.to_string(), email.to_string()))
            .cloned())
    }

    async fn upsert(&self, principal: &Principal) -> StoreResult<()> {
        self.by_email.write().insert(
            (principal.tenant_id.clone(), principal.email.clone()),
            principal.clone(),
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScyllaPrincipalStore {
    client: ScyllaClient,
}

impl ScyllaPrincipalStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn row_to_principal(
        row: scylla::frame::response::result::Row,
    ) -> StoreResult<Principal> {
        let (
            tenant_id,
            email,
            id,
            display_name,
            role,
            extra_permissions,
            password_hash,
            mfa_enrolled,
            active,
            failed_login_attempts,
            locked_until,
            last_login_at,
            last_login_network,
            created_at,
        ): (
            String,
            String,
            String,
            String,
            String,
            Option<Vec<String>>,
            String,
            bool,
            bool,
            i32,
            Option<i64>,
            Option<i64>,
            Option<String>,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Principal {
            id,
            tenant_id,
            email,
            display_name,
            role: role.parse::<Role>().unwrap_or(Role::TenantViewer),
            extra_permissions: extra_permissions.unwrap_or_default(),
            password_hash,
            mfa_enrolled,
            active,
            failed_login_attempts: failed_login_attempts.max(0) as u32,
            locked_until: locked_until.and_then(DateTime::from_timestamp_millis),
            last_login_at: last_login_at.and_then(DateTime::from_timestamp_millis),
            last_login_network,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        })
    }
}

const PRINCIPAL_COLUMNS: &str = "tenant_id, email, id, display_name, role, extra_permissions, \
     password_hash, mfa_enrolled, active, failed_login_attempts, locked_until, \
     last_login_at, last_login_network, created_at";

#[async_trait]
impl PrincipalStore for ScyllaPrincipalStore {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Principal>> {
        // Partitioned by (tenant_id, email); id lookups filter in-partition.
        let query = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM {}.principals WHERE tenant_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            for row in rows {
                let principal = Self::row_to_principal(row)?;
                if principal.id == id {
                    return Ok(Some(principal));
                }
            }
        }
        Ok(None)
    }

    async fn get_by_email(&self, tenant_id: &str, email: &str) -> StoreResult<Option<Principal>> {
        let query = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM {}.principals WHERE tenant_id = ? AND email = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, email))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(Self::row_to_principal(row)?));
            }
        }
        Ok(None)
    }

    async fn upsert(&self, principal: &Principal) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {}.principals ({PRINCIPAL_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );

        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &principal.tenant_id,
                    &principal.email,
                    &principal.id,
                    &principal.display_name,
                    principal.role.as_str(),
                    &principal.extra_permissions,
                    &principal.password_hash,
                    principal.mfa_enrolled,
                    principal.active,
                    principal.failed_login_attempts as i32,
                    principal.locked_until.map(|t| t.timestamp_millis()),
                    principal.last_login_at.map(|t| t.timestamp_millis()),
                    &principal.last_login_network,
                    principal.created_at.timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn email_lookup_is_tenant_scoped() {
        let store = InMemoryPrincipalStore::new();
        let p = Principal::new("t-1", "a@acme.test", "A", Role::TenantUser, "hash");
        store.upsert(&p).await.unwrap();

        assert!(store
            .get_by_email("t-1", "a@acme.test")
            .await
            .unwrap()
            .is_some());
        // Same email under another tenant is a different principal space.
        assert!(store
            .get_by_email("t-2", "a@acme.test")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn get_by_id() {
        let store = InMemoryPrincipalStore::new();
        let p = Principal::new("t-1", "a@acme.test", "A", Role::TenantAdmin, "hash");
        store.upsert(&p).await.unwrap();
        let found = store.get("t-1", &p.id).await.unwrap().unwrap();
        assert_eq!(found.role, Role::TenantAdmin);
    }
}
