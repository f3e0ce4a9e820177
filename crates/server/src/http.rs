//! HTTP endpoints.
//!
//! The control surface: auth flows, API key lifecycle, synthesis,
//! pregeneration, usage summaries, invoices, webhook management, and
//! operational probes. Handlers receive an already-scoped
//! `RequestContext` from the tenant middleware and only add permission
//! checks on top.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Json, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use voxgate_auth::perms;
use voxgate_core::{
    BillingPeriod, CallContext, CredentialScope, Error, EventSelection, NetworkRange,
    RequestContext, UsageMetric, WebhookSubscriber,
};
use voxgate_store::{AgentStore, SessionStore, SubscriberStore, TurnStore, UsageLedger};
use voxgate_usage::UsageRequest;
use voxgate_voice::{fingerprint, Stage};

use crate::metrics::metrics_handler;
use crate::middleware::tenant_middleware;
use crate::state::AppState;
use crate::ws::ws_handler;
use crate::{ApiError, ApiResult};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Auth
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        // API credentials
        .route("/api/v1/api-keys", post(create_api_key))
        .route(
            "/api/v1/api-keys/:id",
            axum::routing::delete(revoke_api_key),
        )
        .route("/api/v1/api-keys/:id/rotate", post(rotate_api_key))
        // Voice
        .route("/api/v1/voice/synthesize", post(synthesize))
        .route("/api/v1/voice/synthesize/stream", post(synthesize_stream))
        .route("/api/v1/voice/synthesize/bulk", post(bulk_synthesize))
        .route("/api/v1/voice/pregenerate", post(pregenerate))
        .route("/api/v1/voice/quality", post(quality_analyze))
        .route("/api/v1/voice/health", get(voice_health))
        // Sessions
        .route("/api/v1/sessions/:id", get(get_session))
        // Usage and billing
        .route("/api/v1/usage/summary", get(usage_summary))
        .route("/api/v1/invoices/:period/finalize", post(finalize_invoice))
        .route("/api/v1/invoices/:period/pay", post(pay_invoice))
        .route("/api/v1/invoices/:period/void", post(void_invoice))
        // Webhooks
        .route("/api/v1/webhooks", post(create_webhook))
        .route("/api/v1/webhooks/:id/test", post(test_webhook))
        // Streaming voice channel
        .route("/ws/voice", get(ws_handler))
        // Probes (never audited)
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            tenant_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn require(ctx: &RequestContext, state: &AppState, permission: &str) -> ApiResult<()> {
    let check = state.roles.check(&ctx.permissions, permission);
    if check.allowed {
        Ok(())
    } else {
        Err(ApiError(Error::Unauthorized {
            required: permission.to_string(),
            held: check.held,
        }))
    }
}

// ---- auth ----

#[derive(Debug, Deserialize)]
struct LoginRequest {
    tenant_slug: String,
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    crate::metrics::record_request("auth_login");
    let source = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    let pair = state
        .login
        .login(&body.tenant_slug, &body.email, &body.password, source)
        .await?;
    Ok(Json(serde_json::json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "access_expires_at": pair.access_expires_at,
        "refresh_expires_at": pair.refresh_expires_at,
        "permissions": pair.permissions,
    })))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let (access_token, expires_at) = state.login.refresh(&body.refresh_token).await?;
    Ok(Json(serde_json::json!({
        "access_token": access_token,
        "access_expires_at": expires_at,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct LogoutRequest {
    #[serde(default)]
    refresh_token: Option<String>,
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<LogoutRequest>>,
) -> ApiResult<StatusCode> {
    let access = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(Error::Unauthenticated("missing bearer token".into())))?;
    let refresh = body.and_then(|Json(b)| b.refresh_token);
    state.login.logout(access, refresh.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- api credentials ----

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    scopes: Vec<String>,
    #[serde(default)]
    allowed_networks: Vec<String>,
    #[serde(default)]
    rate_limit_per_hour: Option<u32>,
    #[serde(default)]
    rate_limit_per_day: Option<u32>,
}

async fn create_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateKeyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::API_KEYS_MANAGE)?;

    let scopes = body
        .scopes
        .iter()
        .map(|s| s.parse::<CredentialScope>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(ApiError)?;
    let networks = body.allowed_networks.into_iter().map(NetworkRange).collect();

    let issued = state
        .api_keys
        .create(
            &ctx.tenant_id,
            &body.name,
            scopes,
            networks,
            body.rate_limit_per_hour,
            body.rate_limit_per_day,
            &ctx.correlation_id,
        )
        .await?;

    // The raw key appears exactly once, here.
    Ok(Json(serde_json::json!({
        "id": issued.credential.id,
        "key": issued.raw_key,
        "key_prefix": issued.credential.key_prefix,
        "scopes": issued.credential.scopes,
    })))
}

#[derive(Debug, Deserialize)]
struct RevokeKeyRequest {
    reason: String,
}

async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(body): Json<RevokeKeyRequest>,
) -> ApiResult<StatusCode> {
    require(&ctx, &state, perms::API_KEYS_MANAGE)?;
    state
        .api_keys
        .revoke(&ctx.tenant_id, &id, &body.reason, &ctx.correlation_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::API_KEYS_MANAGE)?;
    let issued = state
        .api_keys
        .rotate(&ctx.tenant_id, &id, &ctx.correlation_id)
        .await?;
    Ok(Json(serde_json::json!({
        "id": issued.credential.id,
        "key": issued.raw_key,
        "key_prefix": issued.credential.key_prefix,
    })))
}

// ---- voice ----

#[derive(Debug, Deserialize)]
struct SynthesizeRequest {
    text: String,
    agent_id: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Serialize)]
struct SynthesizeResponse {
    audio_hex: String,
    duration_ms: u64,
    elapsed_ms: u64,
    cached: bool,
}

/// Shared synthesis path: cache gate, quota-metered on miss only.
async fn synthesize_inner(
    state: &AppState,
    ctx: &RequestContext,
    agent_id: &str,
    language: Option<&str>,
    text: &str,
) -> ApiResult<(Arc<voxgate_voice::CachedArtifact>, bool, u64)> {
    if text.is_empty() {
        return Err(ApiError(Error::validation("text", "must not be empty")));
    }
    let agent = state
        .storage
        .agents
        .get(&ctx.tenant_id, agent_id)
        .await
        .map_err(Error::from)?
        .filter(|a| a.active)
        .ok_or_else(|| ApiError(Error::not_found("voice_agent")))?;
    let language = language.unwrap_or(&agent.language).to_string();

    let started = std::time::Instant::now();
    let pipeline = state.sessions.pipeline();
    let fp = fingerprint(&agent.voice_id, &agent.tuning, &language, text);

    if let Some(artifact) = pipeline.cache().get(&fp) {
        return Ok((artifact, true, started.elapsed().as_millis() as u64));
    }

    // Fresh synthesis is metered; the recorder is the quota gate.
    let mut request = UsageRequest::new(
        &ctx.tenant_id,
        ctx.tier,
        UsageMetric::SynthesisChars,
        text.chars().count() as f64,
    );
    request.correlation_id = ctx.correlation_id.clone();
    state.recorder.record(request).await?;

    let call_ctx = CallContext::with_timeout(std::time::Duration::from_secs(30));
    let outcome = pipeline.synthesize(&call_ctx, &agent, &language, text).await?;
    Ok((
        outcome.artifact,
        outcome.cache_hit,
        started.elapsed().as_millis() as u64,
    ))
}

async fn synthesize(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<SynthesizeRequest>,
) -> ApiResult<Json<SynthesizeResponse>> {
    require(&ctx, &state, perms::VOICE_SESSION_SYNTHESIZE)?;
    crate::metrics::record_request("synthesize");

    let (artifact, cached, elapsed_ms) = synthesize_inner(
        &state,
        &ctx,
        &body.agent_id,
        body.language.as_deref(),
        &body.text,
    )
    .await?;

    Ok(Json(SynthesizeResponse {
        audio_hex: hex::encode(&artifact.bytes),
        duration_ms: artifact.duration_ms,
        elapsed_ms,
        cached,
    }))
}

async fn synthesize_stream(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<SynthesizeRequest>,
) -> ApiResult<impl IntoResponse> {
    require(&ctx, &state, perms::VOICE_SESSION_SYNTHESIZE)?;

    let (artifact, cached, _) = synthesize_inner(
        &state,
        &ctx,
        &body.agent_id,
        body.language.as_deref(),
        &body.text,
    )
    .await?;

    // Emit the audio as fixed-size chunks as a byte stream.
    const CHUNK: usize = 8 * 1024;
    let bytes = artifact.bytes.clone();
    let stream = futures::stream::iter(
        bytes
            .chunks(CHUNK)
            .map(|c| Ok::<_, std::io::Error>(axum::body::Bytes::copy_from_slice(c)))
            .collect::<Vec<_>>(),
    );

    Ok((
        [
            ("content-type", "application/octet-stream".to_string()),
            ("x-cache-hit", cached.to_string()),
        ],
        Body::from_stream(stream),
    ))
}

#[derive(Debug, Deserialize)]
struct BulkSynthesizeRequest {
    texts: Vec<String>,
    agent_id: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    background: bool,
}

async fn bulk_synthesize(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<BulkSynthesizeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::VOICE_SESSION_SYNTHESIZE)?;
    if body.texts.is_empty() {
        return Err(ApiError(Error::validation("texts", "must not be empty")));
    }

    if body.background {
        let job = state
            .pregen
            .enqueue(
                &ctx.tenant_id,
                &body.agent_id,
                body.language.as_deref(),
                body.texts,
            )
            .await?;
        return Ok(Json(serde_json::json!({ "job_id": job.id })));
    }

    let mut results = Vec::with_capacity(body.texts.len());
    for text in &body.texts {
        match synthesize_inner(&state, &ctx, &body.agent_id, body.language.as_deref(), text).await
        {
            Ok((artifact, cached, elapsed_ms)) => results.push(serde_json::json!({
                "text": text,
                "audio_hex": hex::encode(&artifact.bytes),
                "duration_ms": artifact.duration_ms,
                "elapsed_ms": elapsed_ms,
                "cached": cached,
            })),
            Err(ApiError(e)) => results.push(serde_json::json!({
                "text": text,
                "error": e.code(),
                "message": e.to_string(),
            })),
        }
    }
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Debug, Deserialize)]
struct PregenerateRequest {
    agent_id: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    custom_texts: Vec<String>,
}

async fn pregenerate(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<PregenerateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::VOICE_AGENT_DEPLOY)?;
    let job = state
        .pregen
        .enqueue(
            &ctx.tenant_id,
            &body.agent_id,
            body.language.as_deref(),
            body.custom_texts,
        )
        .await?;
    Ok(Json(serde_json::json!({ "job_id": job.id })))
}

#[derive(Debug, Deserialize)]
struct QualityRequest {
    text: String,
    #[serde(default = "default_quality_threshold")]
    threshold: f32,
}

fn default_quality_threshold() -> f32 {
    0.7
}

async fn quality_analyze(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<QualityRequest>,
) -> ApiResult<Json<voxgate_voice::QualityReport>> {
    require(&ctx, &state, perms::VOICE_SESSION_SYNTHESIZE)?;
    Ok(Json(voxgate_voice::analyze(&body.text, body.threshold)))
}

async fn voice_health(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::ADMIN_AUDIT)?;
    let pipeline = state.sessions.pipeline();
    let latency = pipeline.latency();

    Ok(Json(serde_json::json!({
        "active_sessions": state.sessions.active_count(),
        "cache": {
            "entries": pipeline.cache().len(),
            "bytes": pipeline.cache().size_bytes(),
        },
        "latency": {
            "stt": latency.stats(Stage::Stt),
            "llm": latency.stats(Stage::Llm),
            "tts": latency.stats(Stage::Tts),
            "total": latency.stats(Stage::Total),
        },
    })))
}

// ---- sessions ----

async fn get_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::CONVERSATION_READ)?;
    let session = state
        .storage
        .sessions
        .get(&ctx.tenant_id, &id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| ApiError(Error::not_found("voice_session")))?;
    let turns = state
        .storage
        .turns
        .list_by_session(&id)
        .await
        .map_err(Error::from)?;

    Ok(Json(serde_json::json!({
        "session": session,
        "turns": turns,
    })))
}

// ---- usage and billing ----

async fn usage_summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::ANALYTICS_READ)?;

    let mut services = serde_json::Map::new();
    for metric in UsageMetric::ALL {
        let snapshot = state
            .quota
            .snapshot(&ctx.tenant_id, metric)
            .await
            .unwrap_or_default();
        let limits = state.quota.tier_table().limits(ctx.tier, metric);
        let reference = limits.monthly_soft.or(limits.monthly_hard);
        let percentage = reference
            .filter(|l| *l > 0.0)
            .map(|l| (snapshot.monthly / l * 100.0 * 10.0).round() / 10.0);
        services.insert(
            metric.as_str().to_string(),
            serde_json::json!({
                "daily": snapshot.daily,
                "monthly": snapshot.monthly,
                "total": snapshot.total,
                "unit": metric.unit(),
                "monthly_soft": limits.monthly_soft,
                "monthly_hard": limits.monthly_hard,
                "percentage_used": percentage,
            }),
        );
    }

    let period = BillingPeriod::current();
    let billing_total = state
        .storage
        .usage
        .billing_total(&ctx.tenant_id, &period)
        .await
        .map_err(Error::from)?;

    Ok(Json(serde_json::json!({
        "tenant_id": ctx.tenant_id,
        "tier": ctx.tier,
        "billing_period": period,
        "services": services,
        "billing_total": billing_total,
    })))
}

fn parse_period(raw: &str) -> ApiResult<BillingPeriod> {
    let period = BillingPeriod(raw.to_string());
    if period.bounds().is_none() {
        return Err(ApiError(Error::validation(
            "period",
            "expected YYYY-MM",
        )));
    }
    Ok(period)
}

async fn finalize_invoice(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(period): Path<String>,
) -> ApiResult<Json<voxgate_core::Invoice>> {
    require(&ctx, &state, perms::ORG_BILLING)?;
    let invoice = state
        .invoices
        .finalize(&ctx.tenant_id, &parse_period(&period)?)
        .await?;
    Ok(Json(invoice))
}

#[derive(Debug, Deserialize)]
struct PayRequest {
    reference: String,
}

async fn pay_invoice(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(period): Path<String>,
    Json(body): Json<PayRequest>,
) -> ApiResult<Json<voxgate_core::Invoice>> {
    require(&ctx, &state, perms::ORG_BILLING)?;
    let invoice = state
        .invoices
        .mark_paid(&ctx.tenant_id, &parse_period(&period)?, &body.reference)
        .await?;
    Ok(Json(invoice))
}

#[derive(Debug, Deserialize)]
struct VoidRequest {
    reason: String,
}

async fn void_invoice(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(period): Path<String>,
    Json(body): Json<VoidRequest>,
) -> ApiResult<Json<voxgate_core::Invoice>> {
    require(&ctx, &state, perms::ORG_BILLING)?;
    let invoice = state
        .invoices
        .void(&ctx.tenant_id, &parse_period(&period)?, &body.reason)
        .await?;
    Ok(Json(invoice))
}

// ---- webhooks ----

#[derive(Debug, Deserialize)]
struct CreateWebhookRequest {
    url: String,
    secret: String,
    /// `["*"]` subscribes to everything.
    events: Vec<String>,
    #[serde(default)]
    custom_headers: Vec<(String, String)>,
}

async fn create_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateWebhookRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::WEBHOOK_CREATE)?;
    if !state.quota.tier_table().features(ctx.tier).webhooks {
        return Err(ApiError(Error::business_rule(
            "tier_feature",
            "webhooks are not included in this tier",
        )));
    }

    let selection = if body.events.iter().any(|e| e == "*") {
        EventSelection::All
    } else {
        let kinds = body
            .events
            .iter()
            .map(|e| e.parse())
            .collect::<Result<Vec<_>, _>>()
            .map_err(ApiError)?;
        EventSelection::Kinds(kinds)
    };

    // Shared secrets rest encrypted; the dispatcher opens them to sign.
    let sealed_secret = state.secret_cipher.seal(&ctx.tenant_id, &body.secret)?;
    let mut subscriber =
        WebhookSubscriber::new(&ctx.tenant_id, &body.url, sealed_secret, selection);
    subscriber.custom_headers = body.custom_headers;
    {
        let settings = state.settings.read();
        subscriber.retry_policy.max_attempts = settings.webhook.max_attempts;
        subscriber.retry_policy.delay_secs = settings.webhook.retry_delay_secs;
        subscriber.timeout_secs = settings.webhook.timeout_secs;
    }
    state
        .storage
        .subscribers
        .upsert(&subscriber)
        .await
        .map_err(Error::from)?;

    Ok(Json(serde_json::json!({ "id": subscriber.id })))
}

async fn test_webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require(&ctx, &state, perms::WEBHOOK_TEST)?;
    let delivered = state.dispatcher.send_test(&ctx.tenant_id, &id).await?;
    Ok(Json(serde_json::json!({ "delivered": delivered })))
}

// ---- probes ----

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Ready when the counter store answers.
    match state.counters.multi_get(&["ready_probe".to_string()]).await {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "degraded", "reason": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub agent_id: String,
    #[serde(default)]
    pub language: Option<String>,
    pub token: String,
    #[serde(default)]
    pub caller_id: Option<String>,
}
