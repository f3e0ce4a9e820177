//! Tier defaults: feature flags and usage limits per subscription tier.
//!
//! Limits are data, not code: the table loads once at startup and can be
//! swapped wholesale through [`TierTable::replace`]. Custom-tier tenants
//! get per-tenant overrides on top of the enterprise row.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use voxgate_core::{TenantTier, UsageMetric};

/// Per-metric limits. `None` means no limit of that class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricLimits {
    /// 80%-style warning threshold basis; warnings fire at 80% of this.
    pub monthly_soft: Option<f64>,
    pub monthly_hard: Option<f64>,
    pub daily_hard: Option<f64>,
    /// Lifetime cap; storage only.
    pub total_hard: Option<f64>,
}

/// Feature toggles per tier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TierFeatures {
    pub voice_streaming: bool,
    pub custom_voices: bool,
    pub webhooks: bool,
    pub sms: bool,
    pub priority_support: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierDefaults {
    pub features: TierFeatures,
    pub limits: HashMap<UsageMetric, MetricLimits>,
}

/// Read-mostly tier table with a reload primitive.
#[derive(Debug, Clone)]
pub struct TierTable {
    inner: Arc<RwLock<HashMap<TenantTier, TierDefaults>>>,
}

impl TierTable {
    pub fn builtin() -> Self {
        Self {
            inner: Arc::new(RwLock::new(builtin_tiers())),
        }
    }

    pub fn limits(&self, tier: TenantTier, metric: UsageMetric) -> MetricLimits {
        self.inner
            .read()
            .get(&tier)
            .and_then(|t| t.limits.get(&metric))
            .copied()
            .unwrap_or_default()
    }

    pub fn features(&self, tier: TenantTier) -> TierFeatures {
        self.inner
            .read()
            .get(&tier)
            .map(|t| t.features)
            .unwrap_or_default()
    }

    /// Swap the whole table; used on config reload.
    pub fn replace(&self, table: HashMap<TenantTier, TierDefaults>) {
        *self.inner.write() = table;
        tracing::info!("tier table reloaded");
    }
}

fn limits(
    monthly_soft: f64,
    monthly_hard: f64,
    daily_hard: f64,
) -> MetricLimits {
    MetricLimits {
        monthly_soft: Some(monthly_soft),
        monthly_hard: Some(monthly_hard),
        daily_hard: Some(daily_hard),
        total_hard: None,
    }
}

fn storage_limits(total_hard: f64) -> MetricLimits {
    MetricLimits {
        monthly_soft: None,
        monthly_hard: None,
        daily_hard: None,
        total_hard: Some(total_hard),
    }
}

fn bandwidth_limits(monthly_hard: f64, daily_hard: f64) -> MetricLimits {
    MetricLimits {
        monthly_soft: None,
        monthly_hard: Some(monthly_hard),
        daily_hard: Some(daily_hard),
        total_hard: None,
    }
}

/// Built-in limit table. Values track the production defaults; custom
/// mirrors enterprise until overridden per tenant.
pub fn builtin_tiers() -> HashMap<TenantTier, TierDefaults> {
    use UsageMetric::*;

    let mut starter = TierDefaults {
        features: TierFeatures {
            voice_streaming: true,
            custom_voices: false,
            webhooks: false,
            sms: true,
            priority_support: false,
        },
        ..Default::default()
    };
    starter.limits.insert(SynthesisChars, limits(25_000.0, 30_000.0, 2_000.0));
    starter.limits.insert(SmsMessages, limits(1_000.0, 1_200.0, 50.0));
    starter.limits.insert(CallMinutes, limits(300.0, 360.0, 20.0));
    starter.limits.insert(SearchQueries, limits(500.0, 600.0, 30.0));
    starter.limits.insert(ApiCalls, limits(10_000.0, 12_000.0, 600.0));
    starter.limits.insert(StorageGbMonth, storage_limits(5.0));
    starter.limits.insert(BandwidthGb, bandwidth_limits(10.0, 1.0));

    let mut professional = TierDefaults {
        features: TierFeatures {
            voice_streaming: true,
            custom_voices: true,
            webhooks: true,
            sms: true,
            priority_support: false,
        },
        ..Default::default()
    };
    professional.limits.insert(SynthesisChars, limits(75_000.0, 90_000.0, 5_000.0));
    professional.limits.insert(SmsMessages, limits(3_000.0, 3_600.0, 150.0));
    professional.limits.insert(CallMinutes, limits(1_000.0, 1_200.0, 60.0));
    professional.limits.insert(SearchQueries, limits(1_500.0, 1_800.0, 80.0));
    professional.limits.insert(ApiCalls, limits(50_000.0, 60_000.0, 2_500.0));
    professional.limits.insert(StorageGbMonth, storage_limits(20.0));
    professional.limits.insert(BandwidthGb, bandwidth_limits(50.0, 3.0));

    let mut enterprise = TierDefaults {
        features: TierFeatures {
            voice_streaming: true,
            custom_voices: true,
            webhooks: true,
            sms: true,
            priority_support: true,
        },
        ..Default::default()
    };
    enterprise.limits.insert(SynthesisChars, limits(1_000_000.0, 1_200_000.0, 50_000.0));
    enterprise.limits.insert(SmsMessages, limits(50_000.0, 60_000.0, 2_500.0));
    enterprise.limits.insert(CallMinutes, limits(15_000.0, 18_000.0, 800.0));
    enterprise.limits.insert(SearchQueries, limits(25_000.0, 30_000.0, 1_500.0));
    enterprise.limits.insert(ApiCalls, limits(1_000_000.0, 1_200_000.0, 50_000.0));
    enterprise.limits.insert(StorageGbMonth, storage_limits(500.0));
    enterprise.limits.insert(BandwidthGb, bandwidth_limits(1_000.0, 40.0));

    let custom = enterprise.clone();

    HashMap::from([
        (TenantTier::Starter, starter),
        (TenantTier::Professional, professional),
        (TenantTier::Enterprise, enterprise),
        (TenantTier::Custom, custom),
    ])
}
