//! Usage recorder: the only sanctioned entry point for metered activity.
//!
//! Record path:
//!   1. quota gate (unless force-allow)
//!   2. cost calculation against the cumulative month
//!   3. durable write: event + audit row, atomic; billing total folded in
//!   4. pipelined counter batch: usage + cost across all horizons
//!   5. soft-limit crossing detection, one warning per period
//!
//! The durable write decides success. A failed counter batch is logged
//! and tolerated (reconciliation repairs drift from the ledger); warning
//! detection never fails the call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use voxgate_core::{
    day_bucket, month_bucket, AuditKind, AuditOutcome, AuditRecord, AuditSeverity, CircuitBreaker,
    Error, Result, TenantTier, UsageEvent, UsageMetric,
};
use voxgate_store::{keys, AuditStore, CounterBatch, CounterStore, UsageLedger};

use crate::cost::{CostBreakdown, CostCalculator};
use crate::quota::{QuotaDecision, QuotaEvaluator};

/// TTLs applied to counter cells per horizon.
#[derive(Debug, Clone, Copy)]
pub struct CounterTtls {
    pub day: Duration,
    pub month: Duration,
}

impl Default for CounterTtls {
    fn default() -> Self {
        Self {
            day: Duration::from_secs(7 * 24 * 3600),
            month: Duration::from_secs(13 * 30 * 24 * 3600),
        }
    }
}

/// What the caller gets back from a recorded event.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReceipt {
    pub event_id: String,
    pub tenant_id: String,
    pub metric: UsageMetric,
    pub quantity: f64,
    pub unit: &'static str,
    pub cost: CostBreakdown,
    pub tier: TenantTier,
    /// Residual quantity still allowed after this event.
    pub remaining: f64,
}

/// A request to meter activity.
#[derive(Debug, Clone)]
pub struct UsageRequest {
    pub tenant_id: String,
    pub tier: TenantTier,
    pub metric: UsageMetric,
    pub quantity: f64,
    pub metadata: serde_json::Value,
    /// Bypass quota gates; admin-only paths.
    pub force_allow: bool,
    pub correlation_id: String,
}

impl UsageRequest {
    pub fn new(tenant_id: impl Into<String>, tier: TenantTier, metric: UsageMetric, quantity: f64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tier,
            metric,
            quantity,
            metadata: serde_json::Value::Null,
            force_allow: false,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

pub struct UsageRecorder {
    ledger: Arc<dyn UsageLedger>,
    counters: Arc<dyn CounterStore>,
    audit: Arc<dyn AuditStore>,
    quota: Arc<QuotaEvaluator>,
    cost: CostCalculator,
    ttls: CounterTtls,
    store_circuit: CircuitBreaker,
}

impl UsageRecorder {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        counters: Arc<dyn CounterStore>,
        audit: Arc<dyn AuditStore>,
        quota: Arc<QuotaEvaluator>,
        cost: CostCalculator,
        ttls: CounterTtls,
    ) -> Self {
        Self {
            ledger,
            counters,
            audit,
            quota,
            cost,
            ttls,
            store_circuit: CircuitBreaker::with_defaults("usage_ledger"),
        }
    }

    pub async fn record(&self, request: UsageRequest) -> Result<UsageReceipt> {
        if request.quantity < 0.0 {
            return Err(Error::validation("quantity", "must be non-negative"));
        }

        // 1. Quota gate.
        let decision = self
            .quota
            .evaluate(
                &request.tenant_id,
                request.tier,
                request.metric,
                request.quantity,
            )
            .await;

        if !request.force_allow && !decision.allowed {
            self.audit_limit_exceeded(&request, &decision).await;
            let limit_class = decision
                .limit_class
                .expect("denied decision carries a limit class");
            return Err(Error::QuotaExceeded {
                limit_class,
                limit: decision.limit.unwrap_or(0.0),
                current: decision.current,
                requested: request.quantity,
                remaining: decision.remaining,
            });
        }

        // 2. Cost, from the cumulative month before this event.
        let monthly_before = decision.snapshot.monthly;
        let cost = self.cost.calculate(
            request.tier,
            request.metric,
            monthly_before,
            request.quantity,
        );

        // 3. Durable transaction: event + audit row, billing total folded.
        let event = UsageEvent::new(
            &request.tenant_id,
            request.metric,
            request.quantity,
            cost.total_cost,
            serde_json::json!({
                "tier": request.tier.to_string(),
                "force_allowed": request.force_allow,
                "caller": request.metadata.clone(),
            }),
        );
        let audit_row = AuditRecord::new(
            &request.tenant_id,
            AuditKind::DataUpdate,
            AuditSeverity::Info,
            AuditOutcome::Success,
            &request.correlation_id,
            "usage_recorded",
        )
        .with_details(serde_json::json!({
            "event_id": event.id.clone(),
            "metric": request.metric.as_str(),
            "quantity": request.quantity,
            "cost": cost.total_cost,
        }));

        // One retry on transient store failures, then fail the call.
        self.store_circuit
            .call(async {
                match self.ledger.record(&event, &audit_row).await {
                    Err(e) if e.is_retryable() => self
                        .ledger
                        .record(&event, &audit_row)
                        .await
                        .map_err(Error::from),
                    other => other.map_err(Error::from),
                }
            })
            .await?;

        // 4. Counter batch; failure is tolerated, reconciliation catches up.
        if let Err(e) = self
            .counters
            .execute(self.counter_batch(&request, cost.total_cost))
            .await
        {
            tracing::warn!(
                tenant_id = %request.tenant_id,
                metric = %request.metric,
                error = %e,
                "counter batch failed, counters will reconcile from the ledger"
            );
        }

        // 5. Soft-limit crossing; never fails the call.
        self.check_soft_warning(&request, monthly_before).await;

        Ok(UsageReceipt {
            event_id: event.id,
            tenant_id: request.tenant_id,
            metric: request.metric,
            quantity: request.quantity,
            unit: request.metric.unit(),
            cost,
            tier: request.tier,
            // The decision's residual already accounts for this event.
            remaining: decision.remaining,
        })
    }

    fn counter_batch(&self, request: &UsageRequest, cost: rust_decimal::Decimal) -> CounterBatch {
        use rust_decimal::prelude::ToPrimitive;

        let now = Utc::now();
        let day = day_bucket(now);
        let month = month_bucket(now);
        let tenant = &request.tenant_id;
        let metric = request.metric;
        let cost_f64 = cost.to_f64().unwrap_or(0.0);

        let usage_day = keys::usage_daily(tenant, metric, &day);
        let usage_month = keys::usage_monthly(tenant, metric, &month);
        let cost_day = keys::cost_daily(tenant, metric, &day);
        let cost_month = keys::cost_monthly(tenant, metric, &month);

        CounterBatch::new()
            .incr_by_float(usage_day.as_str(), request.quantity)
            .incr_by_float(usage_month.as_str(), request.quantity)
            .incr_by_float(keys::usage_total(tenant, metric), request.quantity)
            .incr_by_float(cost_day.as_str(), cost_f64)
            .incr_by_float(cost_month.as_str(), cost_f64)
            .incr_by_float(keys::cost_total(tenant), cost_f64)
            .expire(usage_day.as_str(), self.ttls.day)
            .expire(cost_day.as_str(), self.ttls.day)
            .expire(usage_month, self.ttls.month)
            .expire(cost_month, self.ttls.month)
    }

    async fn check_soft_warning(&self, request: &UsageRequest, monthly_before: f64) {
        let Some(threshold) = self.quota.soft_threshold(request.tier, request.metric) else {
            return;
        };
        let monthly_after = monthly_before + request.quantity;
        if !(monthly_before < threshold && monthly_after >= threshold) {
            return;
        }

        // One warning per (tenant, metric, period): a TTL'd marker cell.
        let marker = keys::soft_warning_marker(
            &request.tenant_id,
            request.metric,
            &month_bucket(Utc::now()),
        );
        match self.counters.incr_by_float(&marker, 1.0).await {
            Ok(count) if count > 1.0 => return,
            Ok(_) => {
                let _ = self.counters.expire(&marker, self.ttls.month).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "soft warning marker unavailable");
            }
        }

        tracing::warn!(
            tenant_id = %request.tenant_id,
            metric = %request.metric,
            threshold,
            monthly_after,
            "soft usage limit crossed"
        );
        let record = AuditRecord::new(
            &request.tenant_id,
            AuditKind::LimitWarning,
            AuditSeverity::Medium,
            AuditOutcome::Success,
            &request.correlation_id,
            "soft_limit_crossed",
        )
        .with_details(serde_json::json!({
            "metric": request.metric.as_str(),
            "threshold": threshold,
            "monthly_usage": monthly_after,
        }));
        if let Err(e) = self.audit.append(&record).await {
            tracing::warn!(error = %e, "limit warning audit write failed");
        }
    }

    async fn audit_limit_exceeded(&self, request: &UsageRequest, decision: &QuotaDecision) {
        let record = AuditRecord::new(
            &request.tenant_id,
            AuditKind::LimitExceeded,
            AuditSeverity::Medium,
            AuditOutcome::Denied,
            &request.correlation_id,
            "usage_denied",
        )
        .with_details(serde_json::json!({
            "metric": request.metric.as_str(),
            "requested": request.quantity,
            "limit_class": decision.limit_class,
            "limit": decision.limit,
            "current": decision.current,
            "remaining": decision.remaining,
        }));
        if let Err(e) = self.audit.append(&record).await {
            tracing::warn!(error = %e, "limit exceeded audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use voxgate_config::{PricingTable, TierTable};
    use voxgate_core::{BillingPeriod, LimitClass};
    use voxgate_store::{InMemoryAuditStore, InMemoryCounterStore, InMemoryUsageLedger};

    struct Fixture {
        recorder: UsageRecorder,
        counters: Arc<InMemoryCounterStore>,
        ledger: Arc<InMemoryUsageLedger>,
        audit: Arc<InMemoryAuditStore>,
    }

    fn fixture() -> Fixture {
        let counters = Arc::new(InMemoryCounterStore::new());
        let audit = Arc::new(InMemoryAuditStore::new());
        let ledger = Arc::new(InMemoryUsageLedger::new(audit.clone()));
        let quota = Arc::new(QuotaEvaluator::new(
            counters.clone(),
            audit.clone(),
            TierTable::builtin(),
        ));
        let recorder = UsageRecorder::new(
            ledger.clone(),
            counters.clone(),
            audit.clone(),
            quota,
            CostCalculator::new(PricingTable::builtin()),
            CounterTtls::default(),
        );
        Fixture {
            recorder,
            counters,
            ledger,
            audit,
        }
    }

    async fn monthly_counter(counters: &InMemoryCounterStore, tenant: &str, metric: UsageMetric) -> f64 {
        let key = keys::usage_monthly(tenant, metric, &month_bucket(Utc::now()));
        counters.multi_get(&[key]).await.unwrap()[0].unwrap_or(0.0)
    }

    #[tokio::test]
    async fn happy_path_updates_ledger_and_counters() {
        let f = fixture();
        let receipt = f
            .recorder
            .record(UsageRequest::new(
                "t-1",
                TenantTier::Professional,
                UsageMetric::SynthesisChars,
                13.0,
            ))
            .await
            .unwrap();

        assert_eq!(receipt.quantity, 13.0);
        assert_eq!(receipt.cost.total_cost, Decimal::ZERO);
        assert_eq!(
            monthly_counter(&f.counters, "t-1", UsageMetric::SynthesisChars).await,
            13.0
        );
        let events = f
            .ledger
            .events_for_period("t-1", &BillingPeriod::current())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].quantity, 13.0);
    }

    #[tokio::test]
    async fn quota_denial_persists_nothing() {
        let f = fixture();
        // Starter monthly hard is 30_000; seed 29_995 of 25_000-soft tier.
        let month_key = keys::usage_monthly(
            "t-1",
            UsageMetric::SynthesisChars,
            &month_bucket(Utc::now()),
        );
        f.counters.incr_by_float(&month_key, 29_995.0).await.unwrap();

        let err = f
            .recorder
            .record(UsageRequest::new(
                "t-1",
                TenantTier::Starter,
                UsageMetric::SynthesisChars,
                10.0,
            ))
            .await
            .unwrap_err();

        match err {
            Error::QuotaExceeded {
                limit_class,
                remaining,
                ..
            } => {
                assert_eq!(limit_class, LimitClass::MonthlyHard);
                assert_eq!(remaining, 5.0);
            }
            other => panic!("expected quota error, got {other}"),
        }

        // No usage event persisted; a limit_exceeded audit was.
        let events = f
            .ledger
            .events_for_period("t-1", &BillingPeriod::current())
            .await
            .unwrap();
        assert!(events.is_empty());
        assert!(f
            .audit
            .all_for_tenant("t-1")
            .iter()
            .any(|r| r.kind == AuditKind::LimitExceeded));
    }

    #[tokio::test]
    async fn force_allow_bypasses_quota() {
        let f = fixture();
        let month_key = keys::usage_monthly(
            "t-1",
            UsageMetric::SynthesisChars,
            &month_bucket(Utc::now()),
        );
        f.counters.incr_by_float(&month_key, 30_000.0).await.unwrap();

        let mut request = UsageRequest::new(
            "t-1",
            TenantTier::Starter,
            UsageMetric::SynthesisChars,
            10.0,
        );
        request.force_allow = true;
        f.recorder.record(request).await.unwrap();
    }

    #[tokio::test]
    async fn soft_warning_fires_exactly_once_per_period() {
        let f = fixture();
        // Starter soft threshold = 80% of 25_000 = 20_000.
        let month_key = keys::usage_monthly(
            "t-1",
            UsageMetric::SynthesisChars,
            &month_bucket(Utc::now()),
        );
        f.counters.incr_by_float(&month_key, 19_990.0).await.unwrap();

        // Crossing event.
        f.recorder
            .record(UsageRequest::new(
                "t-1",
                TenantTier::Starter,
                UsageMetric::SynthesisChars,
                20.0,
            ))
            .await
            .unwrap();
        // Subsequent events above the threshold do not re-fire.
        f.recorder
            .record(UsageRequest::new(
                "t-1",
                TenantTier::Starter,
                UsageMetric::SynthesisChars,
                20.0,
            ))
            .await
            .unwrap();

        let warnings = f
            .audit
            .all_for_tenant("t-1")
            .into_iter()
            .filter(|r| r.kind == AuditKind::LimitWarning)
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn overage_cost_lands_in_receipt_and_ledger() {
        let f = fixture();
        let month_key = keys::usage_monthly(
            "t-1",
            UsageMetric::SynthesisChars,
            &month_bucket(Utc::now()),
        );
        // Professional included = 75_000; start fully consumed.
        f.counters.incr_by_float(&month_key, 75_000.0).await.unwrap();

        let receipt = f
            .recorder
            .record(UsageRequest::new(
                "t-1",
                TenantTier::Professional,
                UsageMetric::SynthesisChars,
                1_000.0,
            ))
            .await
            .unwrap();

        // 1000 * 0.00030 * 1.5
        assert_eq!(receipt.cost.total_cost.to_string(), "0.4500");
        let total = f
            .ledger
            .billing_total("t-1", &BillingPeriod::current())
            .await
            .unwrap();
        assert_eq!(total, receipt.cost.total_cost);
    }

    #[tokio::test]
    async fn negative_quantity_is_rejected() {
        let f = fixture();
        let err = f
            .recorder
            .record(UsageRequest::new(
                "t-1",
                TenantTier::Starter,
                UsageMetric::ApiCalls,
                -1.0,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
