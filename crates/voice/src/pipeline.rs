//! The latency-budgeted STT → LLM → TTS turn pipeline.
//!
//! Stage budgets are soft: an over-budget stage still completes, the
//! overage is logged and lands in the rolling distribution. The total
//! turn runs under a hard-cap deadline; when it expires the turn fails
//! and the session manager speaks the fallback line instead — a late
//! result never replaces it. Each provider sits behind its own circuit
//! breaker.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use voxgate_core::{
    CallContext, CircuitBreaker, HistoryTurn, LanguageModel, Result, SpeechToText, TextToSpeech,
    Transcript, TurnOutcome, VoiceAgent,
};

use crate::cache::{CacheOutcome, SynthesisCache};
use crate::fingerprint::fingerprint;
use crate::latency::{LatencyTracker, Stage};

/// Stage budgets and the turn hard cap, in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct PipelineBudgets {
    pub stt_ms: u64,
    pub llm_ms: u64,
    pub tts_ms: u64,
    pub hard_cap_ms: u64,
}

impl Default for PipelineBudgets {
    fn default() -> Self {
        Self {
            stt_ms: 50,
            llm_ms: 100,
            tts_ms: 80,
            hard_cap_ms: 2000,
        }
    }
}

impl From<&voxgate_config::PipelineConfig> for PipelineBudgets {
    fn from(config: &voxgate_config::PipelineConfig) -> Self {
        Self {
            stt_ms: config.stt_budget_ms,
            llm_ms: config.llm_budget_ms,
            tts_ms: config.tts_budget_ms,
            hard_cap_ms: config.total_turn_hard_cap_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TurnTimings {
    pub stt_ms: u64,
    pub llm_ms: u64,
    pub tts_ms: u64,
    pub total_ms: u64,
}

/// Everything one pipeline turn produced.
#[derive(Debug)]
pub struct TurnResult {
    pub transcript: Transcript,
    pub outcome: TurnOutcome,
    pub audio: Arc<crate::cache::CachedArtifact>,
    pub cache_hit: bool,
    pub timings: TurnTimings,
}

pub struct TurnPipeline {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    cache: SynthesisCache,
    budgets: PipelineBudgets,
    latency: Arc<LatencyTracker>,
    stt_circuit: CircuitBreaker,
    llm_circuit: CircuitBreaker,
    tts_circuit: CircuitBreaker,
}

impl TurnPipeline {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        cache: SynthesisCache,
        budgets: PipelineBudgets,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            cache,
            budgets,
            latency: Arc::new(LatencyTracker::new()),
            stt_circuit: CircuitBreaker::with_defaults("stt"),
            llm_circuit: CircuitBreaker::with_defaults("llm"),
            tts_circuit: CircuitBreaker::with_defaults("tts"),
        }
    }

    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }

    pub fn cache(&self) -> &SynthesisCache {
        &self.cache
    }

    pub fn budgets(&self) -> PipelineBudgets {
        self.budgets
    }

    /// Run one full turn under the hard-cap deadline.
    pub async fn run_turn(
        &self,
        ctx: &CallContext,
        agent: &VoiceAgent,
        history: &[HistoryTurn],
        audio: &[u8],
    ) -> Result<TurnResult> {
        let turn_ctx =
            ctx.child_with_timeout(std::time::Duration::from_millis(self.budgets.hard_cap_ms));
        let turn_started = Instant::now();
        let mut timings = TurnTimings::default();

        // Speech to text.
        let stage_started = Instant::now();
        let transcript = self
            .stt_circuit
            .call(self.stt.transcribe(&turn_ctx, audio, &agent.language))
            .await?;
        timings.stt_ms = stage_started.elapsed().as_millis() as u64;
        self.latency
            .record(Stage::Stt, timings.stt_ms, Some(self.budgets.stt_ms));

        // Response generation with the structured-output contract.
        let stage_started = Instant::now();
        let prompt = agent.render_prompt(&[("agent_name", &agent.name)]);
        let outcome = self
            .llm_circuit
            .call(
                self.llm
                    .generate_turn(&turn_ctx, &prompt, history, &transcript.text),
            )
            .await?;
        timings.llm_ms = stage_started.elapsed().as_millis() as u64;
        self.latency
            .record(Stage::Llm, timings.llm_ms, Some(self.budgets.llm_ms));

        // Text to speech, via the single-flight cache.
        let stage_started = Instant::now();
        let synthesis = self
            .synthesize(&turn_ctx, agent, &agent.language, &outcome.reply)
            .await?;
        timings.tts_ms = stage_started.elapsed().as_millis() as u64;
        self.latency
            .record(Stage::Tts, timings.tts_ms, Some(self.budgets.tts_ms));

        timings.total_ms = turn_started.elapsed().as_millis() as u64;
        self.latency
            .record(Stage::Total, timings.total_ms, Some(self.budgets.hard_cap_ms));

        Ok(TurnResult {
            transcript,
            outcome,
            audio: synthesis.artifact,
            cache_hit: synthesis.cache_hit,
            timings,
        })
    }

    /// Synthesize text for an agent through the cache. The producer runs
    /// detached with its own deadline so concurrent waiters are never
    /// starved by one caller's cancellation.
    pub async fn synthesize(
        &self,
        ctx: &CallContext,
        agent: &VoiceAgent,
        language: &str,
        text: &str,
    ) -> Result<CacheOutcome> {
        let fp = fingerprint(&agent.voice_id, &agent.tuning, language, text);

        let tts = self.tts.clone();
        let voice_id = agent.voice_id.clone();
        let tuning = agent.tuning;
        let language_owned = language.to_string();
        let text_owned = text.to_string();
        let producer_budget = std::time::Duration::from_millis(self.budgets.hard_cap_ms.max(1000));

        self.tts_circuit.check()?;
        let result = ctx
            .run(
                "tts",
                self.cache.get_or_build(&fp, move || async move {
                    let producer_ctx = CallContext::with_timeout(producer_budget);
                    tts.synthesize(
                        &producer_ctx,
                        &voice_id,
                        &tuning,
                        &language_owned,
                        &text_owned,
                    )
                    .await
                }),
            )
            .await;

        match &result {
            Ok(_) => self.tts_circuit.record_success(),
            Err(e) if e.is_infrastructure() => self.tts_circuit.record_failure(),
            Err(_) => {}
        }
        result
    }

    /// Synthesize and pin an agent's greeting and fallback lines so the
    /// first call of the day meets its budget.
    pub async fn warm_agent_lines(&self, ctx: &CallContext, agent: &VoiceAgent) -> Result<()> {
        for text in [agent.greeting.as_str(), agent.fallback_message.as_str()] {
            if text.is_empty() {
                continue;
            }
            let outcome = self.synthesize(ctx, agent, &agent.language, text).await?;
            self.cache.pin(&outcome.artifact.fingerprint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ScriptedSpeechToText, ScriptedTextToSpeech, ScriptedTurnModel};
    use std::time::Duration;

    fn pipeline_with(
        stt: Arc<ScriptedSpeechToText>,
        llm: Arc<ScriptedTurnModel>,
        tts: Arc<ScriptedTextToSpeech>,
        budgets: PipelineBudgets,
    ) -> TurnPipeline {
        TurnPipeline::new(
            stt,
            llm,
            tts,
            SynthesisCache::new(1 << 20, Duration::from_secs(3600)),
            budgets,
        )
    }

    fn agent() -> VoiceAgent {
        let mut agent = VoiceAgent::new("t-1", "Ava", "voice-1");
        agent.system_prompt = "You are {agent_name}.".into();
        agent
    }

    #[tokio::test]
    async fn full_turn_produces_audio_and_timings() {
        let stt = ScriptedSpeechToText::new("I'd like a quote");
        let llm = ScriptedTurnModel::new("Happy to help with a quote.");
        let tts = ScriptedTextToSpeech::new();
        let pipeline = pipeline_with(stt, llm, tts, PipelineBudgets::default());

        let result = pipeline
            .run_turn(&CallContext::new(), &agent(), &[], b"pcm")
            .await
            .unwrap();

        assert_eq!(result.transcript.text, "I'd like a quote");
        assert_eq!(result.outcome.reply, "Happy to help with a quote.");
        assert_eq!(
            result.audio.bytes,
            ScriptedTextToSpeech::bytes_for("Happy to help with a quote.")
        );
        assert!(!result.cache_hit);
        assert!(result.timings.total_ms >= result.timings.stt_ms);
    }

    #[tokio::test]
    async fn repeated_reply_hits_the_cache() {
        let stt = ScriptedSpeechToText::new("hello");
        let llm = ScriptedTurnModel::new("Hi there!");
        let tts = ScriptedTextToSpeech::new();
        let pipeline = pipeline_with(stt, llm, tts.clone(), PipelineBudgets::default());

        let first = pipeline
            .run_turn(&CallContext::new(), &agent(), &[], b"pcm")
            .await
            .unwrap();
        let second = pipeline
            .run_turn(&CallContext::new(), &agent(), &[], b"pcm")
            .await
            .unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(tts.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(first.audio.bytes, second.audio.bytes);
    }

    #[tokio::test]
    async fn hard_cap_fails_the_turn() {
        let stt = ScriptedSpeechToText::new("hello");
        let slow_llm = Arc::new(ScriptedTurnModel {
            outcome: parking_lot::Mutex::new(voxgate_core::TurnOutcome {
                reply: "slow".into(),
                ..Default::default()
            }),
            delay: Duration::from_millis(500),
            calls: std::sync::atomic::AtomicU32::new(0),
            fail: parking_lot::Mutex::new(false),
        });
        let tts = ScriptedTextToSpeech::new();
        let pipeline = pipeline_with(
            stt,
            slow_llm,
            tts,
            PipelineBudgets {
                hard_cap_ms: 100,
                ..Default::default()
            },
        );

        let err = pipeline
            .run_turn(&CallContext::new(), &agent(), &[], b"pcm")
            .await
            .unwrap_err();
        assert!(matches!(err, voxgate_core::Error::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn over_budget_stage_still_completes() {
        let stt = ScriptedSpeechToText::with_delay("hello", Duration::from_millis(80));
        let llm = ScriptedTurnModel::new("Hi!");
        let tts = ScriptedTextToSpeech::new();
        let pipeline = pipeline_with(
            stt,
            llm,
            tts,
            PipelineBudgets {
                stt_ms: 50,
                hard_cap_ms: 2000,
                ..Default::default()
            },
        );

        let result = pipeline
            .run_turn(&CallContext::new(), &agent(), &[], b"pcm")
            .await
            .unwrap();
        assert_eq!(result.outcome.reply, "Hi!");
        assert!(pipeline.latency().stats(Stage::Stt).over_budget >= 1);
    }

    #[tokio::test]
    async fn warm_agent_lines_pins_greeting_and_fallback() {
        let stt = ScriptedSpeechToText::new("x");
        let llm = ScriptedTurnModel::new("y");
        let tts = ScriptedTextToSpeech::new();
        let pipeline = pipeline_with(stt, llm, tts, PipelineBudgets::default());
        let agent = agent();

        pipeline
            .warm_agent_lines(&CallContext::new(), &agent)
            .await
            .unwrap();

        let greeting_fp = fingerprint(
            &agent.voice_id,
            &agent.tuning,
            &agent.language,
            &agent.greeting,
        );
        assert!(pipeline.cache().get(&greeting_fp).is_some());
    }
}
