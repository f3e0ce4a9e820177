//! Streaming voice channel.
//!
//! One bidirectional WebSocket per session. Control frames are JSON;
//! audio rides hex-encoded inside `audio_response` frames. Synthesize
//! requests are processed strictly sequentially per session with a
//! bounded queue (2) — a third concurrent request is rejected with a
//! `busy` error. Disconnects (close, inactivity, protocol error) abandon
//! the session and persist final stats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use voxgate_auth::{perms, ResolveInput};
use voxgate_core::{RequestContext, SessionOutcome, SessionState, UsageMetric};
use voxgate_usage::UsageRequest;
use voxgate_voice::LiveSession;

use crate::http::WsQuery;
use crate::state::AppState;

/// Close codes distinguishing the §6 failure classes.
const CLOSE_AUTH_FAILED: u16 = 4401;
const CLOSE_AGENT_NOT_FOUND: u16 = 4404;
const CLOSE_PROTOCOL_ERROR: u16 = 4400;

/// Messages from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsInbound {
    Synthesize { text: String },
    Ping,
    GetStats,
    Hangup,
}

/// Messages to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutbound {
    ConnectionEstablished {
        session_id: String,
        agent_id: String,
        capabilities: Vec<&'static str>,
    },
    AudioResponse {
        audio_hex: String,
        text: String,
        duration_ms: u64,
        cached: bool,
        processing_ms: u64,
    },
    SessionStats {
        session_id: String,
        state: String,
        turn_count: u32,
        messages_processed: u64,
        total_processing_ms: u64,
        connected_secs: u64,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

/// Per-connection counters persisted at teardown.
struct ConnStats {
    connected_at: Instant,
    messages_processed: u64,
    total_processing_ms: u64,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| establish(socket, state, query))
}

async fn establish(mut socket: WebSocket, state: AppState, query: WsQuery) {
    // Resolve the tenant from the access token before anything streams.
    let input = ResolveInput {
        bearer_token: Some(query.token.clone()),
        path: "/ws/voice".to_string(),
        ..Default::default()
    };
    let ctx = match state.resolver.resolve(&input).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::debug!(error = %e, "ws authentication failed");
            close_with(&mut socket, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }
    };
    if !state
        .roles
        .check(&ctx.permissions, perms::VOICE_SESSION_START)
        .allowed
    {
        close_with(&mut socket, CLOSE_AUTH_FAILED, "missing voice_session:start").await;
        return;
    }
    if !state.quota.tier_table().features(ctx.tier).voice_streaming {
        close_with(
            &mut socket,
            CLOSE_AUTH_FAILED,
            "voice streaming not included in this tier",
        )
        .await;
        return;
    }

    let caller_id = query
        .caller_id
        .clone()
        .unwrap_or_else(|| format!("ws-{}", uuid::Uuid::new_v4()));
    let (live, greeting) = match state
        .sessions
        .start(&ctx, &query.agent_id, &caller_id, query.language.as_deref())
        .await
    {
        Ok(started) => started,
        Err(e) => {
            tracing::debug!(agent_id = %query.agent_id, error = %e, "ws session start failed");
            close_with(&mut socket, CLOSE_AGENT_NOT_FOUND, "agent not found or inactive").await;
            return;
        }
    };

    handle_session(socket, state, ctx, live, greeting).await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_session(
    socket: WebSocket,
    state: AppState,
    ctx: RequestContext,
    live: Arc<LiveSession>,
    greeting: voxgate_voice::TurnReply,
) {
    let session_id = live.id();
    let (sender, mut receiver) = socket.split();
    let stats = Arc::new(Mutex::new(ConnStats {
        connected_at: Instant::now(),
        messages_processed: 0,
        total_processing_ms: 0,
    }));

    // Outbound pump: everything to the client funnels through one task.
    enum OutFrame {
        Json(WsOutbound),
        Close(u16, &'static str),
    }
    let (out_tx, mut out_rx) = mpsc::channel::<OutFrame>(32);
    let sender_task = tokio::spawn(async move {
        let mut sender = sender;
        while let Some(frame) = out_rx.recv().await {
            match frame {
                OutFrame::Json(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(error = %e, "ws serialization failed");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                OutFrame::Close(code, reason) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });
    let _ = out_tx
        .send(OutFrame::Json(WsOutbound::ConnectionEstablished {
            session_id: session_id.clone(),
            agent_id: live.agent.id.clone(),
            capabilities: vec!["synthesize", "stats", "hangup"],
        }))
        .await;
    let _ = out_tx
        .send(OutFrame::Json(WsOutbound::AudioResponse {
            audio_hex: hex::encode(&greeting.audio.bytes),
            text: greeting.reply.clone(),
            duration_ms: greeting.audio.duration_ms,
            cached: greeting.cache_hit,
            processing_ms: 0,
        }))
        .await;

    // Synthesis worker: strictly sequential per session, queue bound 2.
    let (synth_tx, mut synth_rx) = mpsc::channel::<String>(2);
    let synth_worker = {
        let state = state.clone();
        let ctx = ctx.clone();
        let live = live.clone();
        let out_tx = out_tx.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            while let Some(text) = synth_rx.recv().await {
                let started = Instant::now();
                let result = session_synthesize(&state, &ctx, &live, &text).await;
                let processing_ms = started.elapsed().as_millis() as u64;
                {
                    let mut s = stats.lock();
                    s.messages_processed += 1;
                    s.total_processing_ms += processing_ms;
                }
                let message = match result {
                    Ok((audio_hex, duration_ms, cached)) => WsOutbound::AudioResponse {
                        audio_hex,
                        text,
                        duration_ms,
                        cached,
                        processing_ms,
                    },
                    Err(e) => WsOutbound::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                };
                if out_tx.send(OutFrame::Json(message)).await.is_err() {
                    break;
                }
            }
        })
    };

    let idle_timeout = Duration::from_secs(
        state.settings.read().server.session_idle_timeout_secs,
    );
    let mut clean_close = false;
    let mut protocol_errors: u32 = 0;

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = tokio::time::sleep(idle_timeout) => {
                tracing::info!(session_id = %session_id, "ws idle timeout");
                break;
            }
        };

        let Some(frame) = frame else { break };
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "ws receive error");
                break;
            }
        };

        live.touch();
        match message {
            Message::Text(text) => {
                let inbound = match serde_json::from_str::<WsInbound>(&text) {
                    Ok(inbound) => inbound,
                    Err(_) => {
                        protocol_errors += 1;
                        if protocol_errors >= 3 {
                            let _ = out_tx
                                .send(OutFrame::Close(
                                    CLOSE_PROTOCOL_ERROR,
                                    "too many malformed messages",
                                ))
                                .await;
                            break;
                        }
                        let _ = out_tx
                            .send(OutFrame::Json(WsOutbound::Error {
                                code: "protocol_error".to_string(),
                                message: "unrecognized message".to_string(),
                            }))
                            .await;
                        continue;
                    }
                };

                match inbound {
                    WsInbound::Synthesize { text } => {
                        if text.is_empty() {
                            let _ = out_tx
                                .send(OutFrame::Json(WsOutbound::Error {
                                    code: "validation".to_string(),
                                    message: "text must not be empty".to_string(),
                                }))
                                .await;
                            continue;
                        }
                        // Queue bound 2: reject the overflow with busy.
                        if synth_tx.try_send(text).is_err() {
                            let _ = out_tx
                                .send(OutFrame::Json(WsOutbound::Error {
                                    code: "busy".to_string(),
                                    message: "synthesis queue full, retry shortly".to_string(),
                                }))
                                .await;
                        }
                    }
                    WsInbound::Ping => {
                        let _ = out_tx.send(OutFrame::Json(WsOutbound::Pong)).await;
                    }
                    WsInbound::GetStats => {
                        let snapshot = live.snapshot();
                        let message = {
                            let s = stats.lock();
                            WsOutbound::SessionStats {
                                session_id: session_id.clone(),
                                state: snapshot.state.to_string(),
                                turn_count: snapshot.turn_count,
                                messages_processed: s.messages_processed,
                                total_processing_ms: s.total_processing_ms,
                                connected_secs: s.connected_at.elapsed().as_secs(),
                            }
                        };
                        let _ = out_tx.send(OutFrame::Json(message)).await;
                    }
                    WsInbound::Hangup => {
                        clean_close = true;
                        break;
                    }
                }
            }
            Message::Ping(_) => {
                // Transport-level pings are answered by axum's machinery;
                // nothing to do beyond the activity touch.
            }
            Message::Close(_) => {
                clean_close = true;
                break;
            }
            _ => {}
        }
    }

    // Teardown: finish the session, persist stats, stop the pumps.
    if clean_close && live.state() == SessionState::InProgress {
        if let Err(e) = state.sessions.end(&live, SessionOutcome::Informational).await {
            tracing::warn!(session_id = %session_id, error = %e, "session end failed");
        }
    } else if let Err(e) = state.sessions.abandon(&live).await {
        tracing::warn!(session_id = %session_id, error = %e, "session abandon failed");
    }

    synth_worker.abort();
    sender_task.abort();

    let s = stats.lock();
    tracing::info!(
        session_id = %session_id,
        messages = s.messages_processed,
        processing_ms = s.total_processing_ms,
        connected_secs = s.connected_at.elapsed().as_secs(),
        "ws connection closed"
    );
}

/// Synthesize text within a live session: cache gate, metered on miss.
async fn session_synthesize(
    state: &AppState,
    ctx: &RequestContext,
    live: &Arc<LiveSession>,
    text: &str,
) -> voxgate_core::Result<(String, u64, bool)> {
    let pipeline = state.sessions.pipeline();
    let language = live.agent.language.clone();
    let fp = voxgate_voice::fingerprint(&live.agent.voice_id, &live.agent.tuning, &language, text);

    if let Some(artifact) = pipeline.cache().get(&fp) {
        return Ok((hex::encode(&artifact.bytes), artifact.duration_ms, true));
    }

    let mut request = UsageRequest::new(
        &ctx.tenant_id,
        ctx.tier,
        UsageMetric::SynthesisChars,
        text.chars().count() as f64,
    );
    request.correlation_id = ctx.correlation_id.clone();
    request.metadata = serde_json::json!({ "session_id": live.id() });
    state.recorder.record(request).await?;

    let outcome = pipeline
        .synthesize(live.context(), &live.agent, &language, text)
        .await?;
    Ok((
        hex::encode(&outcome.artifact.bytes),
        outcome.artifact.duration_ms,
        outcome.cache_hit,
    ))
}
