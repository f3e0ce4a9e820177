//! Tenant persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use voxgate_core::{NetworkRange, Tenant, TenantStatus, TenantTier};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<Tenant>>;
    async fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>>;
    async fn upsert(&self, tenant: &Tenant) -> StoreResult<()>;
    async fn list_by_status(&self, status: TenantStatus) -> StoreResult<Vec<Tenant>>;
}

/// In-memory tenant store for development and tests.
#[derive(Default)]
pub struct InMemoryTenantStore {
    by_id: RwLock<HashMap<String, Tenant>>,
    slug_to_id: RwLock<HashMap<String, String>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn get(&self, id: &str) -> StoreResult<Option<Tenant>> {
        Ok(self.by_id.read().get(id).cloned())
    }

    async fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        let id = match self.slug_to_id.read().get(slug) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        Ok(self.by_id.read().get(&id).cloned())
    }

    async fn upsert(&self, tenant: &Tenant) -> StoreResult<()> {
        self.slug_to_id
            .write()
            .insert(tenant.slug.clone(), tenant.id.clone());
        self.by_id.write().insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn list_by_status(&self, status: TenantStatus) -> StoreResult<Vec<Tenant>> {
        Ok(self
            .by_id
            .read()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }
}

/// ScyllaDB tenant store.
#[derive(Clone)]
pub struct ScyllaTenantStore {
    client: ScyllaClient,
}

impl ScyllaTenantStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn row_to_tenant(
        row: scylla::frame::response::result::Row,
    ) -> StoreResult<Tenant> {
        let (
            id,
            slug,
            name,
            status,
            tier,
            allowed_networks,
            maintenance_mode,
            currency,
            discount_rate,
            created_at,
            updated_at,
        ): (
            String,
            String,
            String,
            String,
            String,
            Option<Vec<String>>,
            bool,
            String,
            f64,
            i64,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(Tenant {
            id,
            slug,
            name,
            status: parse_status(&status),
            tier: tier.parse::<TenantTier>().unwrap_or_default(),
            allowed_networks: allowed_networks
                .unwrap_or_default()
                .into_iter()
                .map(NetworkRange)
                .collect(),
            maintenance_mode,
            currency,
            discount_rate,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
        })
    }
}

fn parse_status(s: &str) -> TenantStatus {
    match s {
        "pending" => TenantStatus::Pending,
        "provisioning" => TenantStatus::Provisioning,
        "active" => TenantStatus::Active,
        "suspended" => TenantStatus::Suspended,
        "terminated" => TenantStatus::Terminated,
        _ => TenantStatus::Error,
    }
}

const TENANT_COLUMNS: &str = "id, slug, name, status, tier, allowed_networks, \
     maintenance_mode, currency, discount_rate, created_at, updated_at";

#[async_trait]
impl TenantStore for ScyllaTenantStore {
    async fn get(&self, id: &str) -> StoreResult<Option<Tenant>> {
        let query = format!(
            "SELECT {TENANT_COLUMNS} FROM {}.tenants WHERE id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(Self::row_to_tenant(row)?));
            }
        }
        Ok(None)
    }

    async fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        let query = format!(
            "SELECT id FROM {}.tenants_by_slug WHERE slug = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (slug,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let id: Option<String> = result
            .rows
            .and_then(|rows| rows.into_iter().next())
            .map(|row| row.into_typed::<(String,)>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?
            .map(|(id,)| id);

        match id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    async fn upsert(&self, tenant: &Tenant) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {}.tenants ({TENANT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        let networks: Vec<String> = tenant
            .allowed_networks
            .iter()
            .map(|n| n.0.clone())
            .collect();

        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &tenant.id,
                    &tenant.slug,
                    &tenant.name,
                    tenant.status.to_string(),
                    tenant.tier.to_string(),
                    networks,
                    tenant.maintenance_mode,
                    &tenant.currency,
                    tenant.discount_rate,
                    tenant.created_at.timestamp_millis(),
                    tenant.updated_at.timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let slug_query = format!(
            "INSERT INTO {}.tenants_by_slug (slug, id) VALUES (?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(slug_query, (&tenant.slug, &tenant.id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::debug!(tenant_id = %tenant.id, slug = %tenant.slug, "tenant upserted");
        Ok(())
    }

    async fn list_by_status(&self, status: TenantStatus) -> StoreResult<Vec<Tenant>> {
        let query = format!(
            "SELECT {TENANT_COLUMNS} FROM {}.tenants WHERE status = ? ALLOW FILTERING",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (status.to_string(),))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut tenants = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                tenants.push(Self::row_to_tenant(row)?);
            }
        }
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let store = InMemoryTenantStore::new();
        let tenant = Tenant::new("acme", "Acme Corp", TenantTier::Professional).unwrap();
        store.upsert(&tenant).await.unwrap();

        let by_id = store.get(&tenant.id).await.unwrap().unwrap();
        assert_eq!(by_id.slug, "acme");

        let by_slug = store.get_by_slug("acme").await.unwrap().unwrap();
        assert_eq!(by_slug.id, tenant.id);

        assert!(store.get_by_slug("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryTenantStore::new();
        let mut a = Tenant::new("acme", "Acme", TenantTier::Starter).unwrap();
        a.status = TenantStatus::Active;
        let b = Tenant::new("beta", "Beta", TenantTier::Starter).unwrap();
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        let active = store.list_by_status(TenantStatus::Active).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].slug, "acme");
    }
}
