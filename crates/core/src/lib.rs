//! Core domain types and traits for voxgate
//!
//! This crate provides the foundational pieces used across all other crates:
//! - The error taxonomy and retry/circuit classification
//! - Tenant, principal, credential, agent, session, usage, invoice and
//!   audit entities
//! - Provider traits for pluggable STT/LLM/TTS backends
//! - Request scoping and deadline/cancellation contexts
//! - Domain events for webhook fan-out

pub mod agent;
pub mod audit;
pub mod circuit;
pub mod context;
pub mod credential;
pub mod error;
pub mod events;
pub mod invoice;
pub mod jobs;
pub mod principal;
pub mod session;
pub mod tenant;
pub mod traits;
pub mod usage;
pub mod webhook;

pub use agent::{AgentStats, ModelParams, VoiceAgent, VoiceTuning, DEFAULT_FALLBACK_MESSAGE};
pub use audit::{AuditKind, AuditOutcome, AuditRecord, AuditSeverity};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use context::{AuthMethod, CallContext, RequestContext};
pub use credential::{ApiCredential, CredentialScope, CredentialStatus};
pub use error::{Error, LimitClass, Result};
pub use events::{DomainEvent, EventKind};
pub use invoice::{generate_invoice_number, Invoice, InvoiceStatus, LineItem};
pub use jobs::{JobStatus, PregenJob};
pub use principal::{Principal, Role};
pub use session::{
    ConversationTurn, SessionOutcome, SessionState, TurnDirection, TurnKind, VoiceSession,
};
pub use tenant::{NetworkRange, Tenant, TenantStatus, TenantTier};
pub use traits::{
    EventSink, HistoryRole, HistoryTurn, LanguageModel, NullEventSink, SpeechToText,
    SynthesizedAudio, TextToSpeech, Transcript, TurnOutcome,
};
pub use usage::{day_bucket, month_bucket, BillingPeriod, Horizon, UsageEvent, UsageMetric};
pub use webhook::{
    DeliveryStats, EventSelection, RetryPolicy, SubscriberStatus, WebhookSubscriber,
};
