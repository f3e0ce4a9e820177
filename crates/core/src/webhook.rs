//! Webhook subscriber records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    /// Disabled after repeated delivery failures; needs operator action.
    Failed,
    Disabled,
}

/// Which event kinds a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSelection {
    /// `*`: everything.
    All,
    Kinds(Vec<EventKind>),
}

impl EventSelection {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// Per-subscriber retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 60,
        }
    }
}

/// Rolling delivery statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// Net failures since the last success; drives auto-disable.
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscriber {
    pub id: String,
    pub tenant_id: String,
    pub url: String,
    /// Shared secret for HMAC signatures; never logged.
    pub secret: String,
    pub events: EventSelection,
    pub custom_headers: Vec<(String, String)>,
    pub retry_policy: RetryPolicy,
    pub timeout_secs: u64,
    pub status: SubscriberStatus,
    pub stats: DeliveryStats,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscriber {
    pub fn new(
        tenant_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
        events: EventSelection,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            url: url.into(),
            secret: secret.into(),
            events,
            custom_headers: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout_secs: 30,
            status: SubscriberStatus::Active,
            stats: DeliveryStats::default(),
            created_at: Utc::now(),
        }
    }

    pub fn record_success(&mut self) {
        self.stats.total += 1;
        self.stats.success += 1;
        self.stats.consecutive_failures = 0;
        self.stats.last_success_at = Some(Utc::now());
    }

    /// Record a net delivery failure; returns true if the subscriber
    /// crossed the disable threshold.
    pub fn record_failure(&mut self, disable_threshold: u32) -> bool {
        self.stats.total += 1;
        self.stats.failure += 1;
        self.stats.consecutive_failures += 1;
        self.stats.last_failure_at = Some(Utc::now());
        if self.stats.consecutive_failures >= disable_threshold {
            self.status = SubscriberStatus::Failed;
            true
        } else {
            false
        }
    }
}
