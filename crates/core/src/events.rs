//! Domain events fanned out to integrator webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted event kinds. `*` in a subscription matches all of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    SessionEnded,
    SessionTransferred,
    LeadCreated,
    LeadUpdated,
    LeadAssigned,
    AppointmentScheduled,
    WebhookTest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionEnded => "session_ended",
            Self::SessionTransferred => "session_transferred",
            Self::LeadCreated => "lead_created",
            Self::LeadUpdated => "lead_updated",
            Self::LeadAssigned => "lead_assigned",
            Self::AppointmentScheduled => "appointment_scheduled",
            Self::WebhookTest => "webhook_test",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_started" => Ok(Self::SessionStarted),
            "session_ended" => Ok(Self::SessionEnded),
            "session_transferred" => Ok(Self::SessionTransferred),
            "lead_created" => Ok(Self::LeadCreated),
            "lead_updated" => Ok(Self::LeadUpdated),
            "lead_assigned" => Ok(Self::LeadAssigned),
            "appointment_scheduled" => Ok(Self::AppointmentScheduled),
            "webhook_test" => Ok(Self::WebhookTest),
            other => Err(crate::error::Error::validation(
                "event",
                format!("unknown event kind '{other}'"),
            )),
        }
    }
}

/// An event awaiting fan-out. `data` is event-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub tenant_id: String,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl DomainEvent {
    pub fn new(kind: EventKind, tenant_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.into(),
            occurred_at: Utc::now(),
            data,
        }
    }
}
