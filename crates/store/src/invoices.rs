//! Invoice persistence. One invoice per (tenant, period); the document
//! travels as JSON with status denormalized for listings.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use voxgate_core::{BillingPeriod, Invoice};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_for_period(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Option<Invoice>>;
    async fn upsert(&self, invoice: &Invoice) -> StoreResult<()>;
    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<Invoice>>;
}

#[derive(Default)]
pub struct InMemoryInvoiceStore {
    invoices: RwLock<HashMap<(String, String), Invoice>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn get_for_period(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Option<Invoice>> {
        Ok(self
            .invoices
            .read()
            .get(&(tenant_id.to_string(), period.0.clone()))
            .cloned())
    }

    async fn upsert(&self, invoice: &Invoice) -> StoreResult<()> {
        self.invoices.write().insert(
            (invoice.tenant_id.clone(), invoice.period.0.clone()),
            invoice.clone(),
        );
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .read()
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, inv)| inv.clone())
            .collect();
        invoices.sort_by(|a, b| b.period.0.cmp(&a.period.0));
        Ok(invoices)
    }
}

#[derive(Clone)]
pub struct ScyllaInvoiceStore {
    client: ScyllaClient,
}

impl ScyllaInvoiceStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InvoiceStore for ScyllaInvoiceStore {
    async fn get_for_period(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Option<Invoice>> {
        let query = format!(
            "SELECT invoice_json FROM {}.invoices WHERE tenant_id = ? AND period = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, &period.0))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let (json,): (String,) = row
                    .into_typed()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let invoice: Invoice = serde_json::from_str(&json)
                    .map_err(|e| StoreError::Corrupt(format!("invoice: {e}")))?;
                return Ok(Some(invoice));
            }
        }
        Ok(None)
    }

    async fn upsert(&self, invoice: &Invoice) -> StoreResult<()> {
        let json =
            serde_json::to_string(invoice).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let query = format!(
            "INSERT INTO {}.invoices (tenant_id, period, id, invoice_json, status, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &invoice.tenant_id,
                    &invoice.period.0,
                    &invoice.id,
                    json,
                    invoice.status.to_string(),
                    Utc::now().timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<Invoice>> {
        let query = format!(
            "SELECT invoice_json FROM {}.invoices WHERE tenant_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut invoices = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (json,): (String,) = row
                    .into_typed()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                invoices.push(
                    serde_json::from_str(&json)
                        .map_err(|e| StoreError::Corrupt(format!("invoice: {e}")))?,
                );
            }
        }
        Ok(invoices)
    }
}
