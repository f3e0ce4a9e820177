//! Usage event ledger: the durable source of truth for metered activity.
//!
//! `record` writes the usage event and its audit row atomically (one
//! logged batch on ScyllaDB, one critical section in memory), then bumps
//! the running billing total. The counter-store increments that mirror
//! these rows for live limit decisions happen elsewhere and are allowed
//! to lag; reconciliation reads back through this ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use scylla::batch::{Batch, BatchType};
use std::collections::HashMap;
use std::sync::Arc;

use voxgate_core::{AuditRecord, BillingPeriod, UsageEvent, UsageMetric};

use crate::audit::{AuditStore, ScyllaAuditStore};
use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Atomically persist one usage event with its audit row and fold the
    /// cost into the period's running billing total.
    async fn record(&self, event: &UsageEvent, audit: &AuditRecord) -> StoreResult<()>;

    /// Sum of event quantities for (tenant, metric) within a period.
    async fn monthly_usage(
        &self,
        tenant_id: &str,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<f64>;

    async fn events_for_period(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Vec<UsageEvent>>;

    async fn billing_total(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Decimal>;
}

#[derive(Default)]
struct LedgerState {
    events: Vec<UsageEvent>,
    billing_totals: HashMap<(String, String), Decimal>,
}

/// In-memory ledger. The event insert, billing-total update and audit
/// append share one critical section, mirroring the transactional write.
pub struct InMemoryUsageLedger {
    state: Mutex<LedgerState>,
    audit: Arc<dyn AuditStore>,
}

impl InMemoryUsageLedger {
    pub fn new(audit: Arc<dyn AuditStore>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            audit,
        }
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn record(&self, event: &UsageEvent, audit: &AuditRecord) -> StoreResult<()> {
        {
            let mut state = self.state.lock();
            state.events.push(event.clone());
            *state
                .billing_totals
                .entry((event.tenant_id.clone(), event.billing_period.0.clone()))
                .or_insert(Decimal::ZERO) += event.cost;
        }
        self.audit.append(audit).await
    }

    async fn monthly_usage(
        &self,
        tenant_id: &str,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<f64> {
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id && e.metric == metric && e.billing_period == *period
            })
            .map(|e| e.quantity)
            .sum())
    }

    async fn events_for_period(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Vec<UsageEvent>> {
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.billing_period == *period)
            .cloned()
            .collect())
    }

    async fn billing_total(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Decimal> {
        Ok(self
            .state
            .lock()
            .billing_totals
            .get(&(tenant_id.to_string(), period.0.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}

/// ScyllaDB ledger. The event and audit rows go out in one logged batch;
/// the billing total lives in a counter table (counters cannot join
/// logged batches) updated immediately after, in micro-currency units.
#[derive(Clone)]
pub struct ScyllaUsageLedger {
    client: ScyllaClient,
}

const MICROS_PER_UNIT: i64 = 1_000_000;

impl ScyllaUsageLedger {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn event_insert_cql(&self) -> String {
        format!(
            "INSERT INTO {}.usage_events \
             (tenant_id, billing_period, recorded_at, id, metric, quantity, unit, cost, metadata_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        )
    }

    fn row_to_event(row: scylla::frame::response::result::Row) -> StoreResult<UsageEvent> {
        let (tenant_id, billing_period, recorded_at, id, metric, quantity, unit, cost, metadata_json): (
            String,
            String,
            i64,
            String,
            String,
            f64,
            String,
            String,
            Option<String>,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(UsageEvent {
            id,
            tenant_id,
            metric: metric
                .parse::<UsageMetric>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            quantity,
            unit,
            cost: cost
                .parse::<Decimal>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            billing_period: BillingPeriod(billing_period),
            recorded_at: DateTime::from_timestamp_millis(recorded_at).unwrap_or_else(Utc::now),
            metadata: metadata_json
                .and_then(|v| serde_json::from_str(&v).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl UsageLedger for ScyllaUsageLedger {
    async fn record(&self, event: &UsageEvent, audit: &AuditRecord) -> StoreResult<()> {
        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(self.event_insert_cql().as_str());
        batch.append_statement(ScyllaAuditStore::insert_cql(self.client.keyspace()).as_str());

        let event_values = (
            &event.tenant_id,
            &event.billing_period.0,
            event.recorded_at.timestamp_millis(),
            &event.id,
            event.metric.as_str(),
            event.quantity,
            &event.unit,
            event.cost.to_string(),
            event.metadata.to_string(),
        );
        let audit_values = ScyllaAuditStore::bind_values(audit);

        self.client
            .session()
            .batch(&batch, (event_values, audit_values))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        // Counter table update; micro-units keep the counter integral.
        let micros = (event.cost * Decimal::from(MICROS_PER_UNIT))
            .try_into()
            .unwrap_or(0i64);
        let total_query = format!(
            "UPDATE {}.billing_totals SET total_micros = total_micros + ? \
             WHERE tenant_id = ? AND billing_period = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                total_query,
                (micros, &event.tenant_id, &event.billing_period.0),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::debug!(
            tenant_id = %event.tenant_id,
            metric = %event.metric,
            quantity = event.quantity,
            cost = %event.cost,
            "usage event recorded"
        );
        Ok(())
    }

    async fn monthly_usage(
        &self,
        tenant_id: &str,
        metric: UsageMetric,
        period: &BillingPeriod,
    ) -> StoreResult<f64> {
        let query = format!(
            "SELECT SUM(quantity) FROM {}.usage_events \
             WHERE tenant_id = ? AND billing_period = ? AND metric = ? ALLOW FILTERING",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, &period.0, metric.as_str()))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let total: Option<f64> = result
            .rows
            .and_then(|rows| rows.into_iter().next())
            .map(|row| row.into_typed::<(Option<f64>,)>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?
            .and_then(|(sum,)| sum);
        Ok(total.unwrap_or(0.0))
    }

    async fn events_for_period(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Vec<UsageEvent>> {
        let query = format!(
            "SELECT tenant_id, billing_period, recorded_at, id, metric, quantity, unit, cost, metadata_json \
             FROM {}.usage_events WHERE tenant_id = ? AND billing_period = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, &period.0))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut events = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                events.push(Self::row_to_event(row)?);
            }
        }
        Ok(events)
    }

    async fn billing_total(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> StoreResult<Decimal> {
        let query = format!(
            "SELECT total_micros FROM {}.billing_totals \
             WHERE tenant_id = ? AND billing_period = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, &period.0))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let micros: i64 = result
            .rows
            .and_then(|rows| rows.into_iter().next())
            .map(|row| row.into_typed::<(i64,)>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?
            .map(|(m,)| m)
            .unwrap_or(0);
        Ok(Decimal::from(micros) / Decimal::from(MICROS_PER_UNIT))
    }
}
