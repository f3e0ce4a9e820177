//! Deterministic providers for tests and local development.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use voxgate_core::{
    CallContext, Error, HistoryTurn, LanguageModel, Result, SpeechToText, SynthesizedAudio,
    TextToSpeech, Transcript, TurnOutcome, VoiceTuning,
};

/// STT that echoes a configured transcript after an optional delay.
pub struct ScriptedSpeechToText {
    pub transcript: Mutex<String>,
    pub delay: Duration,
    pub calls: AtomicU32,
    pub fail: Mutex<bool>,
}

impl ScriptedSpeechToText {
    pub fn new(transcript: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            transcript: Mutex::new(transcript.into()),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            fail: Mutex::new(false),
        })
    }

    pub fn with_delay(transcript: impl Into<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            transcript: Mutex::new(transcript.into()),
            delay,
            calls: AtomicU32::new(0),
            fail: Mutex::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }
}

#[async_trait]
impl SpeechToText for ScriptedSpeechToText {
    async fn transcribe(
        &self,
        ctx: &CallContext,
        _audio: &[u8],
        language: &str,
    ) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let failing = *self.fail.lock();
        let text = self.transcript.lock().clone();
        let language = language.to_string();
        ctx.run("stt", async move {
            tokio::time::sleep(delay).await;
            if failing {
                return Err(Error::ProviderUnavailable {
                    provider: "stt".into(),
                    message: "scripted failure".into(),
                });
            }
            Ok(Transcript {
                text,
                confidence: 0.95,
                language,
            })
        })
        .await
    }

    fn name(&self) -> &str {
        "scripted-stt"
    }
}

/// Language model returning a configured outcome.
pub struct ScriptedTurnModel {
    pub outcome: Mutex<TurnOutcome>,
    pub delay: Duration,
    pub calls: AtomicU32,
    pub fail: Mutex<bool>,
}

impl ScriptedTurnModel {
    pub fn new(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(TurnOutcome {
                reply: reply.into(),
                ..Default::default()
            }),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            fail: Mutex::new(false),
        })
    }

    pub fn set_outcome(&self, outcome: TurnOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }
}

#[async_trait]
impl LanguageModel for ScriptedTurnModel {
    async fn generate_turn(
        &self,
        ctx: &CallContext,
        _system_prompt: &str,
        _history: &[HistoryTurn],
        _transcript: &str,
    ) -> Result<TurnOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let failing = *self.fail.lock();
        let outcome = self.outcome.lock().clone();
        ctx.run("llm", async move {
            tokio::time::sleep(delay).await;
            if failing {
                return Err(Error::ProviderUnavailable {
                    provider: "llm".into(),
                    message: "scripted failure".into(),
                });
            }
            Ok(outcome)
        })
        .await
    }

    fn name(&self) -> &str {
        "scripted-llm"
    }
}

/// TTS producing deterministic bytes derived from the text.
pub struct ScriptedTextToSpeech {
    pub delay: Duration,
    pub calls: AtomicU32,
    pub fail: Mutex<bool>,
}

impl ScriptedTextToSpeech {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            fail: Mutex::new(false),
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicU32::new(0),
            fail: Mutex::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }

    /// The bytes this provider deterministically emits for `text`.
    pub fn bytes_for(text: &str) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.extend_from_slice(b"|pcm16");
        bytes
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTextToSpeech {
    async fn synthesize(
        &self,
        ctx: &CallContext,
        _voice_id: &str,
        _tuning: &VoiceTuning,
        _language: &str,
        text: &str,
    ) -> Result<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let failing = *self.fail.lock();
        let bytes = Self::bytes_for(text);
        let duration_ms = (text.len() as u64) * 60;
        ctx.run("tts", async move {
            tokio::time::sleep(delay).await;
            if failing {
                return Err(Error::ProviderUnavailable {
                    provider: "tts".into(),
                    message: "scripted failure".into(),
                });
            }
            Ok(SynthesizedAudio {
                bytes,
                duration_ms,
                quality: Some(0.92),
            })
        })
        .await
    }

    fn name(&self) -> &str {
        "scripted-tts"
    }
}
