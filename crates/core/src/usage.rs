//! Metered usage: metrics, horizons, and usage events.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Billable metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    SynthesisChars,
    SmsMessages,
    CallMinutes,
    SearchQueries,
    ApiCalls,
    StorageGbMonth,
    BandwidthGb,
}

impl UsageMetric {
    pub const ALL: [UsageMetric; 7] = [
        Self::SynthesisChars,
        Self::SmsMessages,
        Self::CallMinutes,
        Self::SearchQueries,
        Self::ApiCalls,
        Self::StorageGbMonth,
        Self::BandwidthGb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SynthesisChars => "synthesis_chars",
            Self::SmsMessages => "sms_messages",
            Self::CallMinutes => "call_minutes",
            Self::SearchQueries => "search_queries",
            Self::ApiCalls => "api_calls",
            Self::StorageGbMonth => "storage_gb_month",
            Self::BandwidthGb => "bandwidth_gb",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::SynthesisChars => "characters",
            Self::SmsMessages => "messages",
            Self::CallMinutes => "minutes",
            Self::SearchQueries => "queries",
            Self::ApiCalls => "calls",
            Self::StorageGbMonth => "gb_month",
            Self::BandwidthGb => "gb",
        }
    }

    /// Storage is the only metric gated on a lifetime total.
    pub fn uses_total_limit(&self) -> bool {
        matches!(self, Self::StorageGbMonth)
    }
}

impl std::fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UsageMetric {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synthesis_chars" => Ok(Self::SynthesisChars),
            "sms_messages" => Ok(Self::SmsMessages),
            "call_minutes" => Ok(Self::CallMinutes),
            "search_queries" => Ok(Self::SearchQueries),
            "api_calls" => Ok(Self::ApiCalls),
            "storage_gb_month" => Ok(Self::StorageGbMonth),
            "bandwidth_gb" => Ok(Self::BandwidthGb),
            other => Err(crate::error::Error::validation(
                "metric",
                format!("unknown metric '{other}'"),
            )),
        }
    }
}

/// Counter aggregation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    Day,
    Month,
    Lifetime,
}

/// Bucket keys for counter cells, rendered in UTC.
pub fn day_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

pub fn month_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Billing period identifier (`YYYY-MM`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillingPeriod(pub String);

impl BillingPeriod {
    pub fn current() -> Self {
        Self(month_bucket(Utc::now()))
    }

    pub fn of(at: DateTime<Utc>) -> Self {
        Self(month_bucket(at))
    }

    pub fn year(&self) -> Option<i32> {
        self.0.get(0..4)?.parse().ok()
    }

    pub fn month(&self) -> Option<u32> {
        self.0.get(5..7)?.parse().ok()
    }

    /// Inclusive start / exclusive end of the period, UTC.
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (year, month) = (self.year()?, self.month()?);
        let start = chrono::NaiveDate::from_ymd_opt(year, month, 1)?
            .and_hms_opt(0, 0, 0)?
            .and_utc();
        let end = if month == 12 {
            chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)?
        }
        .and_hms_opt(0, 0, 0)?
        .and_utc();
        Some((start, end))
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at.year() == self.year().unwrap_or(0) && at.month() == self.month().unwrap_or(0)
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One metered event. Cost is derived at record time from tier, metric and
/// cumulative month usage, and never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub tenant_id: String,
    pub metric: UsageMetric,
    pub quantity: f64,
    pub unit: String,
    pub cost: Decimal,
    pub billing_period: BillingPeriod,
    pub recorded_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl UsageEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        metric: UsageMetric,
        quantity: f64,
        cost: Decimal,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            metric,
            quantity,
            unit: metric.unit().to_string(),
            cost,
            billing_period: BillingPeriod::of(now),
            recorded_at: now,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_rendering() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(day_bucket(at), "2024-01-15");
        assert_eq!(month_bucket(at), "2024-01");
    }

    #[test]
    fn billing_period_bounds() {
        let period = BillingPeriod("2024-01".to_string());
        let (start, end) = period.bounds().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert!(period.contains(Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap()));
        assert!(!period.contains(end));
    }

    #[test]
    fn december_rolls_into_next_year() {
        let period = BillingPeriod("2023-12".to_string());
        let (_, end) = period.bounds().unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn metric_string_round_trip() {
        for metric in UsageMetric::ALL {
            assert_eq!(metric.as_str().parse::<UsageMetric>().unwrap(), metric);
        }
    }
}
