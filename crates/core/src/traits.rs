//! Provider traits at the external seams.
//!
//! Speech and language-model providers are external streaming services;
//! the pipeline consumes them through these traits and never assumes a
//! concrete vendor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::VoiceTuning;
use crate::context::CallContext;
use crate::error::Result;
use crate::events::DomainEvent;

/// Transcription result for one utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
    pub language: String,
}

/// Speech-to-text provider.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a complete utterance.
    async fn transcribe(&self, ctx: &CallContext, audio: &[u8], language: &str)
        -> Result<Transcript>;

    fn name(&self) -> &str;
}

/// Structured turn outcome from the language model. The model is required
/// to return the reply text plus explicit intent flags; free-form maps are
/// not accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub reply: String,
    #[serde(default)]
    pub lead_qualified: bool,
    #[serde(default)]
    pub needs_transfer: bool,
    #[serde(default)]
    pub conversation_ended: bool,
}

/// One prior exchange handed to the model as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: HistoryRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    Caller,
    Agent,
}

/// Language-model provider with a structured-output contract.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate_turn(
        &self,
        ctx: &CallContext,
        system_prompt: &str,
        history: &[HistoryTurn],
        transcript: &str,
    ) -> Result<TurnOutcome>;

    fn name(&self) -> &str;
}

/// Synthesized audio plus metadata.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub duration_ms: u64,
    /// Provider-reported quality score in [0, 1], if available.
    pub quality: Option<f32>,
}

/// Text-to-speech provider.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(
        &self,
        ctx: &CallContext,
        voice_id: &str,
        tuning: &VoiceTuning,
        language: &str,
        text: &str,
    ) -> Result<SynthesizedAudio>;

    fn name(&self) -> &str;
}

/// Sink for domain events; the webhook dispatcher is the production
/// implementation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}

/// Sink that drops everything; for tests and wiring without webhooks.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn publish(&self, _event: DomainEvent) -> Result<()> {
        Ok(())
    }
}
