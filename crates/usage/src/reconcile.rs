//! Counter reconciliation.
//!
//! The durable ledger is the source of truth; live counters may drift
//! when a counter batch fails after a durable write. The reconciler
//! rebuilds monthly usage cells from the ledger on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use voxgate_core::{month_bucket, BillingPeriod, UsageMetric};
use voxgate_store::{keys, CounterStore, StoreResult, UsageLedger};

pub struct Reconciler {
    ledger: Arc<dyn UsageLedger>,
    counters: Arc<dyn CounterStore>,
    month_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        counters: Arc<dyn CounterStore>,
        month_ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            counters,
            month_ttl,
        }
    }

    /// Rebuild the current month's usage cell for one (tenant, metric)
    /// from durable events.
    pub async fn rebuild_monthly(&self, tenant_id: &str, metric: UsageMetric) -> StoreResult<f64> {
        let period = BillingPeriod::current();
        let truth = self.ledger.monthly_usage(tenant_id, metric, &period).await?;

        let key = keys::usage_monthly(tenant_id, metric, &month_bucket(Utc::now()));
        let live = self.counters.multi_get(&[key.clone()]).await?[0].unwrap_or(0.0);

        if (live - truth).abs() > f64::EPSILON {
            tracing::info!(
                tenant_id = %tenant_id,
                metric = %metric,
                live,
                truth,
                "reconciling drifted counter"
            );
            self.counters.set_with_ttl(&key, truth, self.month_ttl).await?;
        }
        Ok(truth)
    }

    /// Rebuild every metric for a tenant.
    pub async fn rebuild_tenant(&self, tenant_id: &str) -> StoreResult<()> {
        for metric in UsageMetric::ALL {
            self.rebuild_monthly(tenant_id, metric).await?;
        }
        Ok(())
    }

    /// Background loop reconciling the given tenants on an interval.
    /// Returns a shutdown sender.
    pub fn start(
        self: Arc<Self>,
        tenant_ids: Vec<String>,
        interval: Duration,
    ) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for tenant_id in &tenant_ids {
                            if let Err(e) = self.rebuild_tenant(tenant_id).await {
                                tracing::warn!(tenant_id = %tenant_id, error = %e, "reconciliation pass failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("reconciler shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use voxgate_core::{AuditKind, AuditOutcome, AuditRecord, AuditSeverity, UsageEvent};
    use voxgate_store::{InMemoryAuditStore, InMemoryCounterStore, InMemoryUsageLedger};

    #[tokio::test]
    async fn rebuild_restores_dropped_counter_updates() {
        let audit = Arc::new(InMemoryAuditStore::new());
        let ledger = Arc::new(InMemoryUsageLedger::new(audit));
        let counters = Arc::new(InMemoryCounterStore::new());

        // Two durable events, but only one made it into the counters.
        for quantity in [100.0, 50.0] {
            let event = UsageEvent::new(
                "t-1",
                UsageMetric::SynthesisChars,
                quantity,
                Decimal::ZERO,
                serde_json::Value::Null,
            );
            let row = AuditRecord::new(
                "t-1",
                AuditKind::DataUpdate,
                AuditSeverity::Info,
                AuditOutcome::Success,
                "corr",
                "usage_recorded",
            );
            ledger.record(&event, &row).await.unwrap();
        }
        let key = keys::usage_monthly(
            "t-1",
            UsageMetric::SynthesisChars,
            &month_bucket(Utc::now()),
        );
        counters.incr_by_float(&key, 100.0).await.unwrap();

        let reconciler = Reconciler::new(
            ledger,
            counters.clone(),
            Duration::from_secs(3600),
        );
        let truth = reconciler
            .rebuild_monthly("t-1", UsageMetric::SynthesisChars)
            .await
            .unwrap();

        assert_eq!(truth, 150.0);
        let live = counters.multi_get(&[key]).await.unwrap()[0].unwrap();
        assert_eq!(live, 150.0);
    }
}
