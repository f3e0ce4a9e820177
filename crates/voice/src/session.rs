//! Voice session manager: the per-call state machine.
//!
//! Each live session owns a root `CallContext`; cancelling it (client
//! disconnect, inactivity timeout) cancels the in-flight pipeline while
//! already-written turns stay durable. The per-session mutex guards
//! state transitions and sequence allocation only — pipeline stages run
//! without it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use voxgate_core::{
    CallContext, ConversationTurn, DomainEvent, Error, EventKind, EventSink, HistoryRole,
    HistoryTurn, RequestContext, Result, SessionOutcome, SessionState, TurnDirection, TurnKind,
    TurnOutcome, UsageMetric, VoiceAgent, VoiceSession,
};
use voxgate_store::{AgentStore, SessionStore, TurnStore};
use voxgate_usage::{UsageRecorder, UsageRequest};

use crate::cache::CachedArtifact;
use crate::fingerprint::fingerprint;
use crate::pipeline::{TurnPipeline, TurnTimings};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_sessions: usize,
    /// Pipeline failures tolerated before the session is failed.
    pub max_turn_failures: u32,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 500,
            max_turn_failures: 3,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// One live call.
#[derive(Debug)]
pub struct LiveSession {
    pub tenant_id: String,
    pub tier: voxgate_core::TenantTier,
    pub agent: VoiceAgent,
    state: Mutex<VoiceSession>,
    history: Mutex<Vec<HistoryTurn>>,
    last_activity: Mutex<Instant>,
    /// Root context; cancelling it tears down all child operations.
    ctx: CallContext,
}

impl LiveSession {
    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> VoiceSession {
        self.state.lock().clone()
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() > timeout
    }

    fn history_snapshot(&self) -> Vec<HistoryTurn> {
        self.history.lock().clone()
    }

    fn push_history(&self, role: HistoryRole, content: &str) {
        self.history.lock().push(HistoryTurn {
            role,
            content: content.to_string(),
        });
    }
}

/// What one processed turn hands back to the transport.
#[derive(Debug)]
pub struct TurnReply {
    pub sequence: u32,
    pub transcript: String,
    pub reply: String,
    pub audio: Arc<CachedArtifact>,
    pub cache_hit: bool,
    pub timings: TurnTimings,
    /// The reply is the agent's fallback line, not a model response.
    pub fallback: bool,
    pub lead_qualified: bool,
    pub needs_transfer: bool,
    pub conversation_ended: bool,
    /// Session state after intent flags were applied.
    pub session_state: SessionState,
}

pub struct VoiceSessionManager {
    live: RwLock<HashMap<String, Arc<LiveSession>>>,
    sessions: Arc<dyn SessionStore>,
    turns: Arc<dyn TurnStore>,
    agents: Arc<dyn AgentStore>,
    pipeline: Arc<TurnPipeline>,
    recorder: Arc<UsageRecorder>,
    events: Arc<dyn EventSink>,
    config: SessionManagerConfig,
}

impl VoiceSessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        turns: Arc<dyn TurnStore>,
        agents: Arc<dyn AgentStore>,
        pipeline: Arc<TurnPipeline>,
        recorder: Arc<UsageRecorder>,
        events: Arc<dyn EventSink>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            sessions,
            turns,
            agents,
            pipeline,
            recorder,
            events,
            config,
        }
    }

    pub fn pipeline(&self) -> &Arc<TurnPipeline> {
        &self.pipeline
    }

    pub fn active_count(&self) -> usize {
        self.live.read().len()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        self.live.read().get(session_id).cloned()
    }

    /// Start a session: bind the agent, speak the greeting, announce it.
    pub async fn start(
        &self,
        ctx: &RequestContext,
        agent_id: &str,
        caller_id: &str,
        language: Option<&str>,
    ) -> Result<(Arc<LiveSession>, TurnReply)> {
        if self.live.read().len() >= self.config.max_sessions {
            return Err(Error::business_rule(
                "session_capacity",
                "maximum concurrent sessions reached",
            ));
        }

        let agent = self
            .agents
            .get(&ctx.tenant_id, agent_id)
            .await
            .map_err(Error::from)?
            .filter(|a| a.active)
            .ok_or_else(|| Error::not_found("voice_agent"))?;

        let language = language.unwrap_or(&agent.language).to_string();
        let mut session = VoiceSession::new(&ctx.tenant_id, agent_id, caller_id, &language);
        session.transition(SessionState::InProgress)?;

        let live = Arc::new(LiveSession {
            tenant_id: ctx.tenant_id.clone(),
            tier: ctx.tier,
            agent,
            state: Mutex::new(session),
            history: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            ctx: CallContext::new(),
        });

        // Greeting comes from the pinned cache; first call builds it.
        let greeting_text = live.agent.greeting.clone();
        let synthesis = self
            .pipeline
            .synthesize(&live.ctx, &live.agent, &language, &greeting_text)
            .await?;
        self.pipeline.cache().pin(&synthesis.artifact.fingerprint);

        let (session_id, sequence) = {
            let mut state = live.state.lock();
            let seq = state.next_sequence();
            (state.id.clone(), seq)
        };

        self.persist_state(&live).await?;
        self.turns
            .append(&ConversationTurn {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                tenant_id: ctx.tenant_id.clone(),
                sequence,
                direction: TurnDirection::Outbound,
                kind: TurnKind::Speech,
                content: greeting_text.clone(),
                audio_ref: Some(synthesis.artifact.fingerprint.clone()),
                processing_ms: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .map_err(Error::from)?;
        live.push_history(HistoryRole::Agent, &greeting_text);

        self.publish(
            EventKind::SessionStarted,
            &ctx.tenant_id,
            serde_json::json!({
                "session_id": session_id.clone(),
                "agent_id": agent_id,
                "caller_id": caller_id,
                "language": language.clone(),
            }),
        )
        .await;

        self.live.write().insert(session_id.clone(), live.clone());
        metrics::gauge!("voxgate_active_sessions").set(self.live.read().len() as f64);
        tracing::info!(session_id = %session_id, agent_id = %agent_id, "voice session started");

        let reply = TurnReply {
            sequence,
            transcript: String::new(),
            reply: greeting_text,
            audio: synthesis.artifact,
            cache_hit: synthesis.cache_hit,
            timings: TurnTimings::default(),
            fallback: false,
            lead_qualified: false,
            needs_transfer: false,
            conversation_ended: false,
            session_state: SessionState::InProgress,
        };
        Ok((live, reply))
    }

    /// Process one caller utterance through the pipeline.
    pub async fn process_turn(&self, live: &Arc<LiveSession>, audio: &[u8]) -> Result<TurnReply> {
        if live.state() != SessionState::InProgress {
            return Err(Error::business_rule(
                "session_state",
                "session is not accepting speech",
            ));
        }
        live.touch();

        let history = live.history_snapshot();
        let result = self
            .pipeline
            .run_turn(&live.ctx, &live.agent, &history, audio)
            .await;

        match result {
            Ok(turn) => self.commit_turn(live, turn).await,
            Err(e) => self.handle_turn_failure(live, e).await,
        }
    }

    async fn commit_turn(
        &self,
        live: &Arc<LiveSession>,
        turn: crate::pipeline::TurnResult,
    ) -> Result<TurnReply> {
        let (session_id, inbound_seq, outbound_seq) = {
            let mut state = live.state.lock();
            let inbound = state.next_sequence();
            let outbound = state.next_sequence();
            (state.id.clone(), inbound, outbound)
        };

        self.turns
            .append(&ConversationTurn {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                tenant_id: live.tenant_id.clone(),
                sequence: inbound_seq,
                direction: TurnDirection::Inbound,
                kind: TurnKind::Speech,
                content: turn.transcript.text.clone(),
                audio_ref: None,
                processing_ms: Some(turn.timings.stt_ms),
                created_at: chrono::Utc::now(),
            })
            .await
            .map_err(Error::from)?;
        self.turns
            .append(&ConversationTurn {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                tenant_id: live.tenant_id.clone(),
                sequence: outbound_seq,
                direction: TurnDirection::Outbound,
                kind: TurnKind::Speech,
                content: turn.outcome.reply.clone(),
                audio_ref: Some(turn.audio.fingerprint.clone()),
                processing_ms: Some(turn.timings.total_ms),
                created_at: chrono::Utc::now(),
            })
            .await
            .map_err(Error::from)?;

        live.push_history(HistoryRole::Caller, &turn.transcript.text);
        live.push_history(HistoryRole::Agent, &turn.outcome.reply);
        self.persist_state(live).await?;

        // Fresh synthesis is billable; cache hits are not.
        if !turn.cache_hit {
            let mut request = UsageRequest::new(
                &live.tenant_id,
                live.tier,
                UsageMetric::SynthesisChars,
                turn.outcome.reply.chars().count() as f64,
            );
            request.metadata = serde_json::json!({ "session_id": session_id });
            if let Err(e) = self.recorder.record(request).await {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "in-session synthesis usage not recorded"
                );
            }
        }

        // Intent flags act after the audio reply is on its way.
        let session_state = self.apply_intent_flags(live, &turn.outcome).await?;

        Ok(TurnReply {
            sequence: outbound_seq,
            transcript: turn.transcript.text,
            reply: turn.outcome.reply.clone(),
            audio: turn.audio,
            cache_hit: turn.cache_hit,
            timings: turn.timings,
            fallback: false,
            lead_qualified: turn.outcome.lead_qualified,
            needs_transfer: turn.outcome.needs_transfer,
            conversation_ended: turn.outcome.conversation_ended,
            session_state,
        })
    }

    async fn apply_intent_flags(
        &self,
        live: &Arc<LiveSession>,
        outcome: &TurnOutcome,
    ) -> Result<SessionState> {
        if outcome.needs_transfer && live.agent.transfer_enabled {
            self.transfer(live).await?;
        } else if outcome.conversation_ended {
            let tag = if outcome.lead_qualified {
                SessionOutcome::LeadQualified
            } else {
                SessionOutcome::Informational
            };
            self.end(live, tag).await?;
        }
        Ok(live.state())
    }

    async fn handle_turn_failure(
        &self,
        live: &Arc<LiveSession>,
        error: Error,
    ) -> Result<TurnReply> {
        let (session_id, failures) = {
            let mut state = live.state.lock();
            state.failure_count += 1;
            (state.id.clone(), state.failure_count)
        };
        tracing::warn!(
            session_id = %session_id,
            failures,
            error = %error,
            "pipeline turn failed"
        );

        if failures > self.config.max_turn_failures {
            self.finish(live, SessionState::Failed, Some(SessionOutcome::Error))
                .await?;
            return Err(error);
        }

        // Speak the fallback line rather than dropping the call. The
        // fallback is pinned, so this stays local even when providers
        // are down.
        let fallback_text = live.agent.fallback_message.clone();
        let fp = fingerprint(
            &live.agent.voice_id,
            &live.agent.tuning,
            &live.agent.language,
            &fallback_text,
        );
        let audio = match self.pipeline.cache().get(&fp) {
            Some(artifact) => artifact,
            None => {
                self.pipeline
                    .synthesize(&live.ctx, &live.agent, &live.agent.language, &fallback_text)
                    .await?
                    .artifact
            }
        };

        let sequence = {
            let mut state = live.state.lock();
            state.next_sequence()
        };
        self.turns
            .append(&ConversationTurn {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                tenant_id: live.tenant_id.clone(),
                sequence,
                direction: TurnDirection::Outbound,
                kind: TurnKind::SystemEvent,
                content: fallback_text.clone(),
                audio_ref: Some(fp),
                processing_ms: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .map_err(Error::from)?;
        self.persist_state(live).await?;

        Ok(TurnReply {
            sequence,
            transcript: String::new(),
            reply: fallback_text,
            audio,
            cache_hit: true,
            timings: TurnTimings::default(),
            fallback: true,
            lead_qualified: false,
            needs_transfer: false,
            conversation_ended: false,
            session_state: live.state(),
        })
    }

    /// One-way transfer: no further speech stages run for this session.
    pub async fn transfer(&self, live: &Arc<LiveSession>) -> Result<()> {
        let session_id = {
            let mut state = live.state.lock();
            state.transition(SessionState::Transferred)?;
            state.outcome = Some(SessionOutcome::Transferred);
            state.id.clone()
        };
        self.after_terminal(live, &session_id, true).await?;
        self.publish(
            EventKind::SessionTransferred,
            &live.tenant_id,
            serde_json::json!({ "session_id": session_id }),
        )
        .await;
        Ok(())
    }

    /// Normal completion with an outcome tag.
    pub async fn end(&self, live: &Arc<LiveSession>, outcome: SessionOutcome) -> Result<()> {
        self.finish(live, SessionState::Completed, Some(outcome)).await
    }

    /// Disconnect or inactivity without a proper ending.
    pub async fn abandon(&self, live: &Arc<LiveSession>) -> Result<()> {
        if live.state().is_terminal() {
            return Ok(());
        }
        self.finish(live, SessionState::Abandoned, Some(SessionOutcome::NoAnswer))
            .await
    }

    async fn finish(
        &self,
        live: &Arc<LiveSession>,
        terminal: SessionState,
        outcome: Option<SessionOutcome>,
    ) -> Result<()> {
        let session_id = {
            let mut state = live.state.lock();
            state.transition(terminal)?;
            state.outcome = outcome;
            state.id.clone()
        };
        self.after_terminal(live, &session_id, terminal == SessionState::Completed)
            .await?;

        let snapshot = live.snapshot();
        self.publish(
            EventKind::SessionEnded,
            &live.tenant_id,
            serde_json::json!({
                "session_id": session_id,
                "state": snapshot.state,
                "outcome": snapshot.outcome,
                "duration_secs": snapshot.duration().map(|d| d.num_seconds()),
                "turn_count": snapshot.turn_count,
            }),
        )
        .await;
        Ok(())
    }

    async fn after_terminal(
        &self,
        live: &Arc<LiveSession>,
        session_id: &str,
        completed: bool,
    ) -> Result<()> {
        // In-flight pipeline work dies with the session context; durable
        // rows already written stay.
        live.ctx.cancel();
        self.persist_state(live).await?;

        let duration_secs = live
            .snapshot()
            .duration()
            .map(|d| d.num_seconds().max(0) as u64)
            .unwrap_or(0);
        if let Err(e) = self
            .agents
            .record_session(&live.tenant_id, &live.agent.id, completed, duration_secs)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "agent stats update failed");
        }

        // Call minutes are metered on the way out; a finished call is
        // never denied.
        let minutes = (duration_secs as f64 / 60.0).max(0.0);
        if minutes > 0.0 {
            let mut request = UsageRequest::new(
                &live.tenant_id,
                live.tier,
                UsageMetric::CallMinutes,
                minutes,
            );
            request.force_allow = true;
            request.metadata = serde_json::json!({ "session_id": session_id });
            if let Err(e) = self.recorder.record(request).await {
                tracing::warn!(session_id = %session_id, error = %e, "call minutes not recorded");
            }
        }

        self.live.write().remove(session_id);
        metrics::gauge!("voxgate_active_sessions").set(self.live.read().len() as f64);
        Ok(())
    }

    async fn persist_state(&self, live: &Arc<LiveSession>) -> Result<()> {
        let snapshot = live.snapshot();
        self.sessions.upsert(&snapshot).await.map_err(Error::from)
    }

    async fn publish(&self, kind: EventKind, tenant_id: &str, data: serde_json::Value) {
        if let Err(e) = self
            .events
            .publish(DomainEvent::new(kind, tenant_id, data))
            .await
        {
            tracing::warn!(kind = %kind, error = %e, "event publish failed");
        }
    }

    /// Periodically abandon idle sessions. Returns a shutdown sender.
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let idle: Vec<Arc<LiveSession>> = manager
                            .live
                            .read()
                            .values()
                            .filter(|s| s.is_idle(manager.config.idle_timeout))
                            .cloned()
                            .collect();
                        for session in idle {
                            let id = session.id();
                            tracing::info!(session_id = %id, "abandoning idle session");
                            if let Err(e) = manager.abandon(&session).await {
                                tracing::warn!(session_id = %id, error = %e, "idle cleanup failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("session cleanup task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
