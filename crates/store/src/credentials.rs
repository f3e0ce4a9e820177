//! API credential persistence. Lookups are by key hash (the validation hot
//! path) and by tenant for management listings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use voxgate_core::{ApiCredential, CredentialScope, CredentialStatus, NetworkRange};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiCredential>>;
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<ApiCredential>>;
    async fn upsert(&self, credential: &ApiCredential) -> StoreResult<()>;
    /// Remove the hash row when a key is rotated so the old value dies
    /// immediately; the tenant row is replaced by the new upsert.
    async fn remove_hash(&self, key_hash: &str) -> StoreResult<()>;
    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<ApiCredential>>;
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    by_hash: RwLock<HashMap<String, ApiCredential>>,
    tenant_index: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiCredential>> {
        Ok(self.by_hash.read().get(key_hash).cloned())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<ApiCredential>> {
        let hash = match self
            .tenant_index
            .read()
            .get(&(tenant_id.to_string(), id.to_string()))
        {
            Some(hash) => hash.clone(),
            None => return Ok(None),
        };
        Ok(self.by_hash.read().get(&hash).cloned())
    }

    async fn upsert(&self, credential: &ApiCredential) -> StoreResult<()> {
        self.tenant_index.write().insert(
            (credential.tenant_id.clone(), credential.id.clone()),
            credential.key_hash.clone(),
        );
        self.by_hash
            .write()
            .insert(credential.key_hash.clone(), credential.clone());
        Ok(())
    }

    async fn remove_hash(&self, key_hash: &str) -> StoreResult<()> {
        self.by_hash.write().remove(key_hash);
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<ApiCredential>> {
        Ok(self
            .by_hash
            .read()
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct ScyllaCredentialStore {
    client: ScyllaClient,
}

impl ScyllaCredentialStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn row_to_credential(
        row: scylla::frame::response::result::Row,
    ) -> StoreResult<ApiCredential> {
        let (
            key_hash,
            id,
            tenant_id,
            name,
            key_prefix,
            scopes,
            status,
            allowed_networks,
            rate_limit_per_hour,
            rate_limit_per_day,
            expires_at,
            last_used_at,
            created_at,
            rotated_at,
            revoked_at,
            revocation_reason,
        ): (
            String,
            String,
            String,
            String,
            String,
            Option<Vec<String>>,
            String,
            Option<Vec<String>>,
            i32,
            i32,
            Option<i64>,
            Option<i64>,
            i64,
            Option<i64>,
            Option<i64>,
            Option<String>,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(ApiCredential {
            id,
            tenant_id,
            name,
            key_hash,
            key_prefix,
            scopes: scopes
                .unwrap_or_default()
                .iter()
                .filter_map(|s| s.parse::<CredentialScope>().ok())
                .collect(),
            status: match status.as_str() {
                "active" => CredentialStatus::Active,
                "revoked" => CredentialStatus::Revoked,
                _ => CredentialStatus::Expired,
            },
            allowed_networks: allowed_networks
                .unwrap_or_default()
                .into_iter()
                .map(NetworkRange)
                .collect(),
            rate_limit_per_hour: rate_limit_per_hour.max(0) as u32,
            rate_limit_per_day: rate_limit_per_day.max(0) as u32,
            expires_at: expires_at.and_then(DateTime::from_timestamp_millis),
            last_used_at: last_used_at.and_then(DateTime::from_timestamp_millis),
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            rotated_at: rotated_at.and_then(DateTime::from_timestamp_millis),
            revoked_at: revoked_at.and_then(DateTime::from_timestamp_millis),
            revocation_reason,
        })
    }
}

const CREDENTIAL_COLUMNS: &str = "key_hash, id, tenant_id, name, key_prefix, scopes, status, \
     allowed_networks, rate_limit_per_hour, rate_limit_per_day, expires_at, last_used_at, \
     created_at, rotated_at, revoked_at, revocation_reason";

#[async_trait]
impl CredentialStore for ScyllaCredentialStore {
    async fn get_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiCredential>> {
        let query = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM {}.api_credentials WHERE key_hash = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (key_hash,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(Self::row_to_credential(row)?));
            }
        }
        Ok(None)
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<ApiCredential>> {
        let query = format!(
            "SELECT key_hash FROM {}.api_credentials_by_tenant WHERE tenant_id = ? AND id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let hash: Option<String> = result
            .rows
            .and_then(|rows| rows.into_iter().next())
            .map(|row| row.into_typed::<(String,)>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?
            .map(|(hash,)| hash);

        match hash {
            Some(hash) => self.get_by_hash(&hash).await,
            None => Ok(None),
        }
    }

    async fn upsert(&self, credential: &ApiCredential) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {}.api_credentials ({CREDENTIAL_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        let scopes: Vec<String> = credential
            .scopes
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let networks: Vec<String> = credential
            .allowed_networks
            .iter()
            .map(|n| n.0.clone())
            .collect();
        let status = match credential.status {
            CredentialStatus::Active => "active",
            CredentialStatus::Revoked => "revoked",
            CredentialStatus::Expired => "expired",
        };

        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &credential.key_hash,
                    &credential.id,
                    &credential.tenant_id,
                    &credential.name,
                    &credential.key_prefix,
                    scopes,
                    status,
                    networks,
                    credential.rate_limit_per_hour as i32,
                    credential.rate_limit_per_day as i32,
                    credential.expires_at.map(|t| t.timestamp_millis()),
                    credential.last_used_at.map(|t| t.timestamp_millis()),
                    credential.created_at.timestamp_millis(),
                    credential.rotated_at.map(|t| t.timestamp_millis()),
                    credential.revoked_at.map(|t| t.timestamp_millis()),
                    &credential.revocation_reason,
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let index_query = format!(
            "INSERT INTO {}.api_credentials_by_tenant (tenant_id, id, key_hash) VALUES (?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                index_query,
                (&credential.tenant_id, &credential.id, &credential.key_hash),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn remove_hash(&self, key_hash: &str) -> StoreResult<()> {
        let query = format!(
            "DELETE FROM {}.api_credentials WHERE key_hash = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(query, (key_hash,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<ApiCredential>> {
        let query = format!(
            "SELECT key_hash FROM {}.api_credentials_by_tenant WHERE tenant_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut credentials = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (hash,): (String,) = row
                    .into_typed()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                if let Some(credential) = self.get_by_hash(&hash).await? {
                    credentials.push(credential);
                }
            }
        }
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(hash: &str) -> ApiCredential {
        ApiCredential {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "t-1".into(),
            name: "ci".into(),
            key_hash: hash.into(),
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

    #[tokio::test]
    async fn hash_lookup_round_trip() {
        let store = InMemoryCredentialStore::new();
        let cred = credential("hash-1");
        store.upsert(&cred).await.unwrap();
        assert!(store.get_by_hash("hash-1").await.unwrap().is_some());
        assert!(store.get("t-1", &cred.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removed_hash_is_gone() {
        let store = InMemoryCredentialStore::new();
        let cred = credential("hash-1");
        store.upsert(&cred).await.unwrap();
        store.remove_hash("hash-1").await.unwrap();
        assert!(store.get_by_hash("hash-1").await.unwrap().is_none());
    }
}
