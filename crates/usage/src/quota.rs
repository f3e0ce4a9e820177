//! Quota evaluation against live counters.
//!
//! Check order is fixed: daily hard → monthly hard → total hard (storage
//! only). Hard violations deny; the 80% soft threshold never denies and
//! is detected by the recorder. When the counter store is unreachable the
//! evaluator fails open and leaves an audit note, so a counters outage
//! degrades billing accuracy rather than availability.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use voxgate_core::{
    day_bucket, month_bucket, AuditKind, AuditOutcome, AuditRecord, AuditSeverity, LimitClass,
    TenantTier, UsageMetric,
};
use voxgate_config::TierTable;
use voxgate_store::{keys, AuditStore, CounterStore};

/// Counter readings for one (tenant, metric) across the horizons.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageSnapshot {
    pub daily: f64,
    pub monthly: f64,
    pub total: f64,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// The limit class that would be breached, when denied.
    pub limit_class: Option<LimitClass>,
    pub limit: Option<f64>,
    pub current: f64,
    pub requested: f64,
    /// Residual quantity that would still be allowed.
    pub remaining: f64,
    pub snapshot: UsageSnapshot,
    /// Set when the evaluator failed open on a counters outage.
    pub fail_open: bool,
}

impl QuotaDecision {
    fn allow(snapshot: UsageSnapshot, requested: f64, remaining: f64) -> Self {
        Self {
            allowed: true,
            limit_class: None,
            limit: None,
            current: snapshot.monthly,
            requested,
            remaining,
            snapshot,
            fail_open: false,
        }
    }

    fn deny(
        snapshot: UsageSnapshot,
        requested: f64,
        class: LimitClass,
        limit: f64,
        current: f64,
    ) -> Self {
        Self {
            allowed: false,
            limit_class: Some(class),
            limit: Some(limit),
            current,
            requested,
            remaining: (limit - current).max(0.0),
            snapshot,
            fail_open: false,
        }
    }
}

pub struct QuotaEvaluator {
    counters: Arc<dyn CounterStore>,
    audit: Arc<dyn AuditStore>,
    tiers: TierTable,
}

impl QuotaEvaluator {
    pub fn new(counters: Arc<dyn CounterStore>, audit: Arc<dyn AuditStore>, tiers: TierTable) -> Self {
        Self {
            counters,
            audit,
            tiers,
        }
    }

    pub fn tier_table(&self) -> &TierTable {
        &self.tiers
    }

    /// Read the current counters for one (tenant, metric).
    pub async fn snapshot(
        &self,
        tenant_id: &str,
        metric: UsageMetric,
    ) -> Result<UsageSnapshot, voxgate_store::StoreError> {
        let now = Utc::now();
        let counter_keys = vec![
            keys::usage_daily(tenant_id, metric, &day_bucket(now)),
            keys::usage_monthly(tenant_id, metric, &month_bucket(now)),
            keys::usage_total(tenant_id, metric),
        ];
        let values = self.counters.multi_get(&counter_keys).await?;
        Ok(UsageSnapshot {
            daily: values[0].unwrap_or(0.0),
            monthly: values[1].unwrap_or(0.0),
            total: values[2].unwrap_or(0.0),
        })
    }

    /// Evaluate whether `additional` units of `metric` fit the tier limits.
    pub async fn evaluate(
        &self,
        tenant_id: &str,
        tier: TenantTier,
        metric: UsageMetric,
        additional: f64,
    ) -> QuotaDecision {
        let limits = self.tiers.limits(tier, metric);

        let snapshot = match self.snapshot(tenant_id, metric).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    metric = %metric,
                    error = %e,
                    "counter store unavailable, quota check fails open"
                );
                let note = AuditRecord::new(
                    tenant_id,
                    AuditKind::CounterUnavailable,
                    AuditSeverity::Medium,
                    AuditOutcome::Success,
                    uuid::Uuid::new_v4().to_string(),
                    "quota_fail_open",
                )
                .with_details(serde_json::json!({
                    "metric": metric.as_str(),
                    "requested": additional,
                }));
                if let Err(audit_err) = self.audit.append(&note).await {
                    tracing::warn!(error = %audit_err, "fail-open audit note failed");
                }
                let mut decision =
                    QuotaDecision::allow(UsageSnapshot::default(), additional, f64::INFINITY);
                decision.fail_open = true;
                return decision;
            }
        };

        if let Some(daily_hard) = limits.daily_hard {
            if snapshot.daily + additional > daily_hard {
                return QuotaDecision::deny(
                    snapshot,
                    additional,
                    LimitClass::DailyHard,
                    daily_hard,
                    snapshot.daily,
                );
            }
        }

        if let Some(monthly_hard) = limits.monthly_hard {
            if snapshot.monthly + additional > monthly_hard {
                return QuotaDecision::deny(
                    snapshot,
                    additional,
                    LimitClass::MonthlyHard,
                    monthly_hard,
                    snapshot.monthly,
                );
            }
        }

        if metric.uses_total_limit() {
            if let Some(total_hard) = limits.total_hard {
                if snapshot.total + additional > total_hard {
                    return QuotaDecision::deny(
                        snapshot,
                        additional,
                        LimitClass::TotalHard,
                        total_hard,
                        snapshot.total,
                    );
                }
            }
        }

        let remaining = [
            limits.daily_hard.map(|l| l - snapshot.daily - additional),
            limits.monthly_hard.map(|l| l - snapshot.monthly - additional),
        ]
        .into_iter()
        .flatten()
        .fold(f64::INFINITY, f64::min);

        QuotaDecision::allow(snapshot, additional, remaining.max(0.0))
    }

    /// The soft-warning threshold for a (tier, metric): 80% of the monthly
    /// soft limit, falling back to 80% of the hard limit.
    pub fn soft_threshold(&self, tier: TenantTier, metric: UsageMetric) -> Option<f64> {
        let limits = self.tiers.limits(tier, metric);
        limits
            .monthly_soft
            .or(limits.monthly_hard)
            .map(|l| l * 0.8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxgate_store::{InMemoryAuditStore, InMemoryCounterStore};

    fn evaluator() -> (QuotaEvaluator, Arc<InMemoryCounterStore>) {
        let counters = Arc::new(InMemoryCounterStore::new());
        let eval = QuotaEvaluator::new(
            counters.clone(),
            Arc::new(InMemoryAuditStore::new()),
            TierTable::builtin(),
        );
        (eval, counters)
    }

    async fn seed_monthly(counters: &InMemoryCounterStore, tenant: &str, metric: UsageMetric, v: f64) {
        let key = keys::usage_monthly(tenant, metric, &month_bucket(Utc::now()));
        counters.incr_by_float(&key, v).await.unwrap();
    }

    #[tokio::test]
    async fn allows_within_limits() {
        let (eval, _) = evaluator();
        let decision = eval
            .evaluate("t-1", TenantTier::Starter, UsageMetric::SynthesisChars, 100.0)
            .await;
        assert!(decision.allowed);
        assert!(decision.limit_class.is_none());
    }

    #[tokio::test]
    async fn monthly_hard_limit_denies_at_boundary() {
        let (eval, counters) = evaluator();
        // Starter synthesis: monthly hard 30_000.
        seed_monthly(&counters, "t-1", UsageMetric::SynthesisChars, 29_995.0).await;

        // Exactly filling the limit is allowed.
        let fits = eval
            .evaluate("t-1", TenantTier::Starter, UsageMetric::SynthesisChars, 5.0)
            .await;
        assert!(fits.allowed);

        // One more unit is denied with the right class and residual.
        let denied = eval
            .evaluate("t-1", TenantTier::Starter, UsageMetric::SynthesisChars, 6.0)
            .await;
        assert!(!denied.allowed);
        assert_eq!(denied.limit_class, Some(LimitClass::MonthlyHard));
        assert_eq!(denied.limit, Some(30_000.0));
        assert_eq!(denied.remaining, 5.0);
    }

    #[tokio::test]
    async fn daily_limit_checked_before_monthly() {
        let (eval, counters) = evaluator();
        // Starter daily hard for synthesis is 2_000.
        let day_key = keys::usage_daily("t-1", UsageMetric::SynthesisChars, &day_bucket(Utc::now()));
        counters.incr_by_float(&day_key, 1_999.0).await.unwrap();
        seed_monthly(&counters, "t-1", UsageMetric::SynthesisChars, 29_999.0).await;

        let denied = eval
            .evaluate("t-1", TenantTier::Starter, UsageMetric::SynthesisChars, 2.0)
            .await;
        assert_eq!(denied.limit_class, Some(LimitClass::DailyHard));
    }

    #[tokio::test]
    async fn storage_uses_total_limit() {
        let (eval, counters) = evaluator();
        let total_key = keys::usage_total("t-1", UsageMetric::StorageGbMonth);
        counters.incr_by_float(&total_key, 4.5).await.unwrap();

        let denied = eval
            .evaluate("t-1", TenantTier::Starter, UsageMetric::StorageGbMonth, 1.0)
            .await;
        assert_eq!(denied.limit_class, Some(LimitClass::TotalHard));

        let allowed = eval
            .evaluate("t-1", TenantTier::Starter, UsageMetric::StorageGbMonth, 0.5)
            .await;
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn soft_threshold_is_80_percent_of_soft_limit() {
        let (eval, _) = evaluator();
        assert_eq!(
            eval.soft_threshold(TenantTier::Starter, UsageMetric::SynthesisChars),
            Some(20_000.0)
        );
    }
}
