//! Webhook subscriber persistence. The subscriber document (secret,
//! selection, retry policy, stats) travels as JSON.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use voxgate_core::{SubscriberStatus, WebhookSubscriber};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<WebhookSubscriber>>;
    async fn upsert(&self, subscriber: &WebhookSubscriber) -> StoreResult<()>;
    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<WebhookSubscriber>>;
    async fn list_active(&self, tenant_id: &str) -> StoreResult<Vec<WebhookSubscriber>>;
}

#[derive(Default)]
pub struct InMemorySubscriberStore {
    subscribers: RwLock<HashMap<(String, String), WebhookSubscriber>>,
}

impl InMemorySubscriberStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<WebhookSubscriber>> {
        Ok(self
            .subscribers
            .read()
            .get(&(tenant_id.to_string(), id.to_string()))
            .cloned())
    }

    async fn upsert(&self, subscriber: &WebhookSubscriber) -> StoreResult<()> {
        self.subscribers.write().insert(
            (subscriber.tenant_id.clone(), subscriber.id.clone()),
            subscriber.clone(),
        );
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<WebhookSubscriber>> {
        Ok(self
            .subscribers
            .read()
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn list_active(&self, tenant_id: &str) -> StoreResult<Vec<WebhookSubscriber>> {
        Ok(self
            .list_by_tenant(tenant_id)
            .await?
            .into_iter()
            .filter(|s| s.status == SubscriberStatus::Active)
            .collect())
    }
}

#[derive(Clone)]
pub struct ScyllaSubscriberStore {
    client: ScyllaClient,
}

impl ScyllaSubscriberStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn parse(json: &str) -> StoreResult<WebhookSubscriber> {
        serde_json::from_str(json).map_err(|e| StoreError::Corrupt(format!("subscriber: {e}")))
    }
}

#[async_trait]
impl SubscriberStore for ScyllaSubscriberStore {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<WebhookSubscriber>> {
        let query = format!(
            "SELECT subscriber_json FROM {}.webhook_subscribers WHERE tenant_id = ? AND id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let (json,): (String,) = row
                    .into_typed()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                return Ok(Some(Self::parse(&json)?));
            }
        }
        Ok(None)
    }

    async fn upsert(&self, subscriber: &WebhookSubscriber) -> StoreResult<()> {
        let json = serde_json::to_string(subscriber)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let status = match subscriber.status {
            SubscriberStatus::Active => "active",
            SubscriberStatus::Failed => "failed",
            SubscriberStatus::Disabled => "disabled",
        };
        let query = format!(
            "INSERT INTO {}.webhook_subscribers (tenant_id, id, subscriber_json, status, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &subscriber.tenant_id,
                    &subscriber.id,
                    json,
                    status,
                    Utc::now().timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<WebhookSubscriber>> {
        let query = format!(
            "SELECT subscriber_json FROM {}.webhook_subscribers WHERE tenant_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut subscribers = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (json,): (String,) = row
                    .into_typed()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                subscribers.push(Self::parse(&json)?);
            }
        }
        Ok(subscribers)
    }

    async fn list_active(&self, tenant_id: &str) -> StoreResult<Vec<WebhookSubscriber>> {
        Ok(self
            .list_by_tenant(tenant_id)
            .await?
            .into_iter()
            .filter(|s| s.status == SubscriberStatus::Active)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxgate_core::EventSelection;

    #[tokio::test]
    async fn active_listing_excludes_failed() {
        let store = InMemorySubscriberStore::new();
        let healthy = WebhookSubscriber::new("t-1", "https://a.test", "s", EventSelection::All);
        let mut broken = WebhookSubscriber::new("t-1", "https://b.test", "s", EventSelection::All);
        broken.status = SubscriberStatus::Failed;
        store.upsert(&healthy).await.unwrap();
        store.upsert(&broken).await.unwrap();

        let active = store.list_active("t-1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].url, "https://a.test");
    }
}
