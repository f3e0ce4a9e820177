//! Tier-aware cost calculation: included quota first, then overage.
//!
//! Let `used` be cumulative month usage, `add` the new quantity, `inc`
//! the included amount, `p` the unit price and `m` the overage
//! multiplier. Then:
//!   - `used + add <= inc`  → cost 0
//!   - `used >= inc`        → cost = add * p * m
//!   - otherwise (split)    → cost = (used + add - inc) * p * m
//!
//! Money is `rust_decimal`, rounded to four fractional digits with
//! banker's rounding at final aggregation.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use voxgate_config::PricingTable;
use voxgate_core::{TenantTier, UsageMetric};

/// Cost breakdown returned with every recorded event.
#[derive(Debug, Clone, Serialize)]
pub struct CostBreakdown {
    pub total_cost: Decimal,
    pub overage_cost: Decimal,
    /// Units absorbed by the included quota.
    pub included_used: f64,
    /// Included units left after this event.
    pub included_remaining: f64,
    /// Units billed at the overage rate.
    pub overage_used: f64,
    /// Effective overage price per unit.
    pub overage_rate: Decimal,
    pub pricing_tier: TenantTier,
}

impl CostBreakdown {
    pub fn free(tier: TenantTier) -> Self {
        Self {
            total_cost: Decimal::ZERO,
            overage_cost: Decimal::ZERO,
            included_used: 0.0,
            included_remaining: 0.0,
            overage_used: 0.0,
            overage_rate: Decimal::ZERO,
            pricing_tier: tier,
        }
    }
}

#[derive(Clone)]
pub struct CostCalculator {
    pricing: PricingTable,
}

impl CostCalculator {
    pub fn new(pricing: PricingTable) -> Self {
        Self { pricing }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn calculate(
        &self,
        tier: TenantTier,
        metric: UsageMetric,
        cumulative_monthly: f64,
        additional: f64,
    ) -> CostBreakdown {
        let Some(entry) = self.pricing.entry(metric, tier) else {
            // No pricing row: the metric is free for this tier.
            return CostBreakdown::free(tier);
        };

        let used = cumulative_monthly.max(0.0);
        let add = additional.max(0.0);
        let included = entry.included;
        let overage_rate = entry.price * entry.overage_multiplier;

        let round = |value: Decimal| {
            value.round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven)
        };
        let dec = |value: f64| Decimal::from_f64(value).unwrap_or(Decimal::ZERO);

        if used + add <= included {
            // Entirely inside the included quota.
            CostBreakdown {
                total_cost: Decimal::ZERO,
                overage_cost: Decimal::ZERO,
                included_used: add,
                included_remaining: included - used - add,
                overage_used: 0.0,
                overage_rate,
                pricing_tier: tier,
            }
        } else if used >= included {
            // Quota already exhausted; everything is overage.
            let cost = round(dec(add) * overage_rate);
            CostBreakdown {
                total_cost: cost,
                overage_cost: cost,
                included_used: 0.0,
                included_remaining: 0.0,
                overage_used: add,
                overage_rate,
                pricing_tier: tier,
            }
        } else {
            // Split across the boundary.
            let included_portion = included - used;
            let overage_portion = used + add - included;
            let cost = round(dec(overage_portion) * overage_rate);
            CostBreakdown {
                total_cost: cost,
                overage_cost: cost,
                included_used: included_portion,
                included_remaining: 0.0,
                overage_used: overage_portion,
                overage_rate,
                pricing_tier: tier,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn calculator() -> CostCalculator {
        CostCalculator::new(PricingTable::builtin())
    }

    #[test]
    fn within_included_quota_is_free() {
        let c = calculator();
        let breakdown = c.calculate(
            TenantTier::Professional,
            UsageMetric::SynthesisChars,
            10_000.0,
            5_000.0,
        );
        assert_eq!(breakdown.total_cost, Decimal::ZERO);
        assert_eq!(breakdown.included_used, 5_000.0);
        assert_eq!(breakdown.included_remaining, 60_000.0);
    }

    #[test]
    fn fully_over_quota_bills_everything_at_overage() {
        let c = calculator();
        // Professional synthesis: price 0.00030, multiplier 1.5.
        let breakdown = c.calculate(
            TenantTier::Professional,
            UsageMetric::SynthesisChars,
            80_000.0,
            1_000.0,
        );
        assert_eq!(breakdown.overage_used, 1_000.0);
        assert_eq!(breakdown.overage_rate, dec!(0.00045));
        assert_eq!(breakdown.total_cost, dec!(0.4500));
    }

    #[test]
    fn split_bills_only_the_excess() {
        let c = calculator();
        // 74_000 used of 75_000 included; 2_000 more splits 1_000/1_000.
        let breakdown = c.calculate(
            TenantTier::Professional,
            UsageMetric::SynthesisChars,
            74_000.0,
            2_000.0,
        );
        assert_eq!(breakdown.included_used, 1_000.0);
        assert_eq!(breakdown.overage_used, 1_000.0);
        assert_eq!(breakdown.total_cost, dec!(0.4500));
    }

    #[test]
    fn exact_boundary_is_still_free() {
        let c = calculator();
        let breakdown = c.calculate(
            TenantTier::Professional,
            UsageMetric::SynthesisChars,
            74_000.0,
            1_000.0,
        );
        assert_eq!(breakdown.total_cost, Decimal::ZERO);
        assert_eq!(breakdown.included_remaining, 0.0);
    }

    #[test]
    fn invoice_scenario_hundred_thousand_chars() {
        // 100k chars in a month at professional: 25k over the 75k quota.
        let c = calculator();
        let breakdown = c.calculate(
            TenantTier::Professional,
            UsageMetric::SynthesisChars,
            75_000.0,
            25_000.0,
        );
        // 25_000 * 0.00030 * 1.5 = 11.25
        assert_eq!(breakdown.total_cost, dec!(11.2500));
    }

    #[test]
    fn rounding_is_bankers_at_four_digits() {
        let table = PricingTable::empty();
        table.set(
            UsageMetric::ApiCalls,
            TenantTier::Starter,
            voxgate_config::PriceEntry {
                price: dec!(0.00005),
                included: 0.0,
                overage_multiplier: dec!(1),
            },
        );
        let c = CostCalculator::new(table);
        // 5 * 0.00005 = 0.00025: ties to even → 0.0002.
        let breakdown = c.calculate(TenantTier::Starter, UsageMetric::ApiCalls, 100.0, 5.0);
        assert_eq!(breakdown.total_cost, dec!(0.0002));
        // 15 * 0.00005 = 0.00075: ties to even → 0.0008.
        let breakdown = c.calculate(TenantTier::Starter, UsageMetric::ApiCalls, 100.0, 15.0);
        assert_eq!(breakdown.total_cost, dec!(0.0008));
    }

    #[test]
    fn missing_pricing_row_is_free() {
        let c = CostCalculator::new(PricingTable::empty());
        let breakdown = c.calculate(
            TenantTier::Starter,
            UsageMetric::SynthesisChars,
            1_000_000.0,
            1_000.0,
        );
        assert_eq!(breakdown.total_cost, Decimal::ZERO);
    }
}
