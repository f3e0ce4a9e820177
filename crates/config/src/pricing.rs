//! Pricing table: per (metric, tier) price, included monthly quota, and
//! overage multiplier.
//!
//! Monetary values are `rust_decimal` fixed-point. The table is read-mostly
//! and swappable at runtime, like the tier table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use voxgate_core::{TenantTier, UsageMetric};

/// One pricing row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceEntry {
    /// Price per unit (per character, per message, per minute, ...).
    pub price: Decimal,
    /// Units included per month before overage billing starts.
    pub included: f64,
    /// Overage units bill at `price * overage_multiplier`.
    pub overage_multiplier: Decimal,
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    inner: Arc<RwLock<HashMap<(UsageMetric, TenantTier), PriceEntry>>>,
}

impl PricingTable {
    pub fn builtin() -> Self {
        Self {
            inner: Arc::new(RwLock::new(builtin_pricing())),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn entry(&self, metric: UsageMetric, tier: TenantTier) -> Option<PriceEntry> {
        self.inner.read().get(&(metric, tier)).copied()
    }

    pub fn set(&self, metric: UsageMetric, tier: TenantTier, entry: PriceEntry) {
        self.inner.write().insert((metric, tier), entry);
    }

    pub fn replace(&self, table: HashMap<(UsageMetric, TenantTier), PriceEntry>) {
        *self.inner.write() = table;
        tracing::info!("pricing table reloaded");
    }
}

fn row(price: Decimal, included: f64, overage_multiplier: Decimal) -> PriceEntry {
    PriceEntry {
        price,
        included,
        overage_multiplier,
    }
}

/// Built-in prices, tracking the production tables.
pub fn builtin_pricing() -> HashMap<(UsageMetric, TenantTier), PriceEntry> {
    use TenantTier::*;
    use UsageMetric::*;

    let mut t = HashMap::new();

    // Synthesis, priced per character.
    t.insert((SynthesisChars, Starter), row(dec!(0.00035), 25_000.0, dec!(1.5)));
    t.insert((SynthesisChars, Professional), row(dec!(0.00030), 75_000.0, dec!(1.5)));
    t.insert((SynthesisChars, Enterprise), row(dec!(0.00025), 200_000.0, dec!(1.5)));
    t.insert((SynthesisChars, Custom), row(dec!(0.00020), 1_000_000.0, dec!(1.5)));

    // SMS, per message.
    t.insert((SmsMessages, Starter), row(dec!(0.0075), 1_000.0, dec!(1.3)));
    t.insert((SmsMessages, Professional), row(dec!(0.0070), 3_000.0, dec!(1.3)));
    t.insert((SmsMessages, Enterprise), row(dec!(0.0065), 10_000.0, dec!(1.3)));
    t.insert((SmsMessages, Custom), row(dec!(0.0060), 50_000.0, dec!(1.3)));

    // Call minutes.
    t.insert((CallMinutes, Starter), row(dec!(0.013), 300.0, dec!(1.4)));
    t.insert((CallMinutes, Professional), row(dec!(0.012), 1_000.0, dec!(1.4)));
    t.insert((CallMinutes, Enterprise), row(dec!(0.011), 3_000.0, dec!(1.4)));
    t.insert((CallMinutes, Custom), row(dec!(0.010), 15_000.0, dec!(1.4)));

    // Search queries.
    t.insert((SearchQueries, Starter), row(dec!(0.050), 500.0, dec!(1.6)));
    t.insert((SearchQueries, Professional), row(dec!(0.045), 1_500.0, dec!(1.6)));
    t.insert((SearchQueries, Enterprise), row(dec!(0.040), 5_000.0, dec!(1.6)));
    t.insert((SearchQueries, Custom), row(dec!(0.035), 25_000.0, dec!(1.6)));

    // API calls.
    t.insert((ApiCalls, Starter), row(dec!(0.0010), 10_000.0, dec!(1.2)));
    t.insert((ApiCalls, Professional), row(dec!(0.0009), 50_000.0, dec!(1.2)));
    t.insert((ApiCalls, Enterprise), row(dec!(0.0008), 200_000.0, dec!(1.2)));
    t.insert((ApiCalls, Custom), row(dec!(0.0007), 1_000_000.0, dec!(1.2)));

    // Storage, per GB-month.
    t.insert((StorageGbMonth, Starter), row(dec!(0.023), 5.0, dec!(1.3)));
    t.insert((StorageGbMonth, Professional), row(dec!(0.021), 20.0, dec!(1.3)));
    t.insert((StorageGbMonth, Enterprise), row(dec!(0.019), 100.0, dec!(1.3)));
    t.insert((StorageGbMonth, Custom), row(dec!(0.017), 500.0, dec!(1.3)));

    // Bandwidth, per GB.
    t.insert((BandwidthGb, Starter), row(dec!(0.090), 10.0, dec!(1.5)));
    t.insert((BandwidthGb, Professional), row(dec!(0.085), 50.0, dec!(1.5)));
    t.insert((BandwidthGb, Enterprise), row(dec!(0.080), 200.0, dec!(1.5)));
    t.insert((BandwidthGb, Custom), row(dec!(0.075), 1_000.0, dec!(1.5)));

    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn professional_synthesis_pricing() {
        let table = PricingTable::builtin();
        let entry = table
            .entry(UsageMetric::SynthesisChars, TenantTier::Professional)
            .unwrap();
        assert_eq!(entry.price, dec!(0.00030));
        assert_eq!(entry.included, 75_000.0);
        assert_eq!(entry.overage_multiplier, dec!(1.5));
    }

    #[test]
    fn table_covers_every_metric_and_tier() {
        let table = PricingTable::builtin();
        for metric in UsageMetric::ALL {
            for tier in [
                TenantTier::Starter,
                TenantTier::Professional,
                TenantTier::Enterprise,
                TenantTier::Custom,
            ] {
                assert!(table.entry(metric, tier).is_some(), "{metric} {tier}");
            }
        }
    }

    #[test]
    fn set_overrides_a_row() {
        let table = PricingTable::builtin();
        table.set(
            UsageMetric::SynthesisChars,
            TenantTier::Professional,
            PriceEntry {
                price: dec!(0.00030),
                included: 75_000.0,
                overage_multiplier: dec!(1.3),
            },
        );
        let entry = table
            .entry(UsageMetric::SynthesisChars, TenantTier::Professional)
            .unwrap();
        assert_eq!(entry.overage_multiplier, dec!(1.3));
    }
}
