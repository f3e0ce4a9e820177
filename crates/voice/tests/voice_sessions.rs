//! End-to-end voice session flows against in-memory backends.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use voxgate_config::{PricingTable, TierTable};
use voxgate_core::{
    day_bucket, month_bucket, EventSink, RequestContext, SessionOutcome, SessionState,
    TenantTier, TurnDirection, TurnOutcome, VoiceAgent,
};
use voxgate_store::{
    keys, AgentStore, CounterStore, InMemoryAgentStore, InMemoryAuditStore,
    InMemoryCounterStore, InMemorySessionStore, InMemoryTurnStore, InMemoryUsageLedger,
    TurnStore,
};
use voxgate_usage::{CostCalculator, CounterTtls, QuotaEvaluator, UsageRecorder};
use voxgate_voice::providers::{ScriptedSpeechToText, ScriptedTextToSpeech, ScriptedTurnModel};
use voxgate_voice::{
    PipelineBudgets, SessionManagerConfig, SynthesisCache, TurnPipeline, VoiceSessionManager,
};

/// Event sink that remembers everything it saw.
#[derive(Default)]
struct RecordingSink {
    events: parking_lot::Mutex<Vec<voxgate_core::DomainEvent>>,
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: voxgate_core::DomainEvent) -> voxgate_core::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

struct Fixture {
    manager: Arc<VoiceSessionManager>,
    turns: Arc<InMemoryTurnStore>,
    agents: Arc<InMemoryAgentStore>,
    counters: Arc<InMemoryCounterStore>,
    sink: Arc<RecordingSink>,
    stt: Arc<ScriptedSpeechToText>,
    llm: Arc<ScriptedTurnModel>,
    tts: Arc<ScriptedTextToSpeech>,
    agent: VoiceAgent,
}

async fn fixture() -> Fixture {
    fixture_with(
        PipelineBudgets::default(),
        SessionManagerConfig::default(),
        Duration::ZERO,
    )
    .await
}

async fn fixture_with(
    budgets: PipelineBudgets,
    config: SessionManagerConfig,
    llm_delay: Duration,
) -> Fixture {
    let counters = Arc::new(InMemoryCounterStore::new());
    let audit = Arc::new(InMemoryAuditStore::new());
    let ledger = Arc::new(InMemoryUsageLedger::new(audit.clone()));
    let sessions = Arc::new(InMemorySessionStore::new());
    let turns = Arc::new(InMemoryTurnStore::new());
    let agents = Arc::new(InMemoryAgentStore::new());
    let sink = Arc::new(RecordingSink::default());

    let agent = VoiceAgent::new("t-acme", "Ava", "voice-1");
    agents.upsert(&agent).await.unwrap();

    let stt = ScriptedSpeechToText::new("Hello, I'm looking for pricing.");
    let llm = Arc::new(ScriptedTurnModel {
        outcome: parking_lot::Mutex::new(TurnOutcome {
            reply: "Our starter plan begins at fifty dollars.".into(),
            ..Default::default()
        }),
        delay: llm_delay,
        calls: std::sync::atomic::AtomicU32::new(0),
        fail: parking_lot::Mutex::new(false),
    });
    let tts = ScriptedTextToSpeech::new();

    let pipeline = Arc::new(TurnPipeline::new(
        stt.clone(),
        llm.clone(),
        tts.clone(),
        SynthesisCache::new(1 << 22, Duration::from_secs(3600)),
        budgets,
    ));
    let quota = Arc::new(QuotaEvaluator::new(
        counters.clone(),
        audit.clone(),
        TierTable::builtin(),
    ));
    let recorder = Arc::new(UsageRecorder::new(
        ledger,
        counters.clone(),
        audit,
        quota,
        CostCalculator::new(PricingTable::builtin()),
        CounterTtls::default(),
    ));

    let manager = Arc::new(VoiceSessionManager::new(
        sessions,
        turns.clone(),
        agents.clone(),
        pipeline,
        recorder,
        sink.clone(),
        config,
    ));

    Fixture {
        manager,
        turns,
        agents,
        counters,
        sink,
        stt,
        llm,
        tts,
        agent,
    }
}

fn request_ctx() -> RequestContext {
    RequestContext {
        tenant_id: "t-acme".into(),
        tenant_slug: "acme".into(),
        tier: TenantTier::Professional,
        principal_id: Some("p-1".into()),
        permissions: Arc::new(vec!["voice_session:start".into()]),
        source_addr: None,
        correlation_id: "corr-1".into(),
        auth_method: voxgate_core::AuthMethod::SessionToken,
    }
}

#[tokio::test]
async fn session_lifecycle_with_dense_turn_sequence() {
    let f = fixture().await;
    let (live, greeting) = f
        .manager
        .start(&request_ctx(), &f.agent.id, "+15550100", None)
        .await
        .unwrap();

    assert_eq!(live.state(), SessionState::InProgress);
    assert_eq!(greeting.sequence, 1);
    assert_eq!(greeting.reply, f.agent.greeting);

    // Two caller turns.
    for _ in 0..2 {
        f.manager.process_turn(&live, b"pcm-audio").await.unwrap();
    }
    f.manager
        .end(&live, SessionOutcome::Informational)
        .await
        .unwrap();

    // Turn count in the durable store equals max(sequence): greeting +
    // 2 * (inbound + outbound) = 5, dense with no gaps.
    let session_id = live.id();
    let stored = f.turns.list_by_session(&session_id).await.unwrap();
    assert_eq!(stored.len(), 5);
    for (i, turn) in stored.iter().enumerate() {
        assert_eq!(turn.sequence, (i + 1) as u32);
    }
    assert_eq!(
        f.turns.count(&session_id).await.unwrap(),
        stored.iter().map(|t| t.sequence).max().unwrap()
    );
    assert_eq!(stored[1].direction, TurnDirection::Inbound);
    assert_eq!(stored[2].direction, TurnDirection::Outbound);
    assert!(stored[2].audio_ref.is_some());

    // Agent stats reflect the completed call.
    let agent = f.agents.get("t-acme", &f.agent.id).await.unwrap().unwrap();
    assert_eq!(agent.stats.total_sessions, 1);
    assert_eq!(agent.stats.completed_sessions, 1);

    // Events: started and ended.
    let events = f.sink.events.lock();
    assert!(events
        .iter()
        .any(|e| e.kind == voxgate_core::EventKind::SessionStarted));
    let ended: Vec<_> = events
        .iter()
        .filter(|e| e.kind == voxgate_core::EventKind::SessionEnded)
        .collect();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].data["turn_count"], 5);
}

#[tokio::test]
async fn repeated_reply_synthesis_is_cached_and_metered_once() {
    let f = fixture().await;
    let (live, _) = f
        .manager
        .start(&request_ctx(), &f.agent.id, "+15550100", None)
        .await
        .unwrap();

    let first = f.manager.process_turn(&live, b"audio").await.unwrap();
    let second = f.manager.process_turn(&live, b"audio").await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.audio.bytes, second.audio.bytes);

    // Usage counted for the fresh synthesis only.
    let reply_chars = first.reply.chars().count() as f64;
    let key = keys::usage_monthly(
        "t-acme",
        voxgate_core::UsageMetric::SynthesisChars,
        &month_bucket(chrono::Utc::now()),
    );
    let monthly = f.counters.multi_get(&[key]).await.unwrap()[0].unwrap_or(0.0);
    assert_eq!(monthly, reply_chars);
}

#[tokio::test]
async fn transfer_intent_moves_session_one_way() {
    let f = fixture().await;
    let mut agent = f.agent.clone();
    agent.transfer_enabled = true;
    f.agents.upsert(&agent).await.unwrap();

    let (live, _) = f
        .manager
        .start(&request_ctx(), &agent.id, "+15550100", None)
        .await
        .unwrap();

    f.llm.set_outcome(TurnOutcome {
        reply: "Connecting you to a specialist now.".into(),
        needs_transfer: true,
        ..Default::default()
    });

    let reply = f.manager.process_turn(&live, b"audio").await.unwrap();
    assert!(reply.needs_transfer);
    assert_eq!(reply.session_state, SessionState::Transferred);

    // No further speech stages run after a transfer.
    assert!(f.manager.process_turn(&live, b"audio").await.is_err());

    let events = f.sink.events.lock();
    assert!(events
        .iter()
        .any(|e| e.kind == voxgate_core::EventKind::SessionTransferred));
}

#[tokio::test]
async fn hard_cap_yields_exactly_one_fallback_message() {
    // The model takes far longer than the 80ms turn hard cap.
    let f = fixture_with(
        PipelineBudgets {
            hard_cap_ms: 80,
            ..Default::default()
        },
        SessionManagerConfig::default(),
        Duration::from_secs(2),
    )
    .await;

    let (live, _) = f
        .manager
        .start(&request_ctx(), &f.agent.id, "+15550100", None)
        .await
        .unwrap();

    let reply = f.manager.process_turn(&live, b"audio").await.unwrap();
    assert!(reply.fallback);
    assert_eq!(reply.reply, f.agent.fallback_message);
    assert_eq!(live.state(), SessionState::InProgress);

    // Exactly one fallback turn landed in the store for this failure.
    let fallbacks = f
        .turns
        .list_by_session(&live.id())
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == voxgate_core::TurnKind::SystemEvent)
        .count();
    assert_eq!(fallbacks, 1);
}

#[tokio::test]
async fn repeated_failures_fail_the_session_and_dispatch() {
    let f = fixture_with(
        PipelineBudgets::default(),
        SessionManagerConfig {
            max_turn_failures: 3,
            ..Default::default()
        },
        Duration::ZERO,
    )
    .await;

    let (live, _) = f
        .manager
        .start(&request_ctx(), &f.agent.id, "+15550100", None)
        .await
        .unwrap();
    f.stt.set_failing(true);

    // Three tolerated failures speak the fallback line.
    for _ in 0..3 {
        let reply = f.manager.process_turn(&live, b"audio").await.unwrap();
        assert!(reply.fallback);
    }
    // The fourth fails the session.
    assert!(f.manager.process_turn(&live, b"audio").await.is_err());
    assert_eq!(live.state(), SessionState::Failed);

    let events = f.sink.events.lock();
    let ended: Vec<_> = events
        .iter()
        .filter(|e| e.kind == voxgate_core::EventKind::SessionEnded)
        .collect();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].data["state"], "failed");
}

#[tokio::test]
async fn abandoned_session_is_terminal_and_idempotent() {
    let f = fixture().await;
    let (live, _) = f
        .manager
        .start(&request_ctx(), &f.agent.id, "+15550100", None)
        .await
        .unwrap();

    f.manager.abandon(&live).await.unwrap();
    assert_eq!(live.state(), SessionState::Abandoned);
    // A second disconnect-driven abandon is a no-op.
    f.manager.abandon(&live).await.unwrap();
    assert!(live.context().is_cancelled());
}

#[tokio::test]
async fn inactive_agent_is_rejected() {
    let f = fixture().await;
    let mut agent = f.agent.clone();
    agent.active = false;
    f.agents.upsert(&agent).await.unwrap();

    let err = f
        .manager
        .start(&request_ctx(), &agent.id, "+15550100", None)
        .await
        .unwrap_err();
    assert!(matches!(err, voxgate_core::Error::NotFound { .. }));
}

#[tokio::test]
async fn greeting_synthesis_calls_provider_once_across_sessions() {
    let f = fixture().await;
    for _ in 0..3 {
        let (live, greeting) = f
            .manager
            .start(&request_ctx(), &f.agent.id, "+15550100", None)
            .await
            .unwrap();
        assert_eq!(greeting.reply, f.agent.greeting);
        f.manager.abandon(&live).await.unwrap();
    }
    // Greeting is pinned after the first build; later sessions hit it.
    assert_eq!(f.tts.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn daily_counter_also_tracks_usage() {
    let f = fixture().await;
    let (live, _) = f
        .manager
        .start(&request_ctx(), &f.agent.id, "+15550100", None)
        .await
        .unwrap();
    let reply = f.manager.process_turn(&live, b"audio").await.unwrap();

    let key = keys::usage_daily(
        "t-acme",
        voxgate_core::UsageMetric::SynthesisChars,
        &day_bucket(chrono::Utc::now()),
    );
    let daily = f.counters.multi_get(&[key]).await.unwrap()[0].unwrap_or(0.0);
    assert_eq!(daily, reply.reply.chars().count() as f64);
}
