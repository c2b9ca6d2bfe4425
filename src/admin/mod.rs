//! The administrative HTTP surface: orchestration entry point, PnL/halt
//! controls, stream/DLQ introspection, notification ack/recent. See spec
//! §4.8 and §6.

pub mod auth;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::notifier::{self, RecentRing};
use crate::broker::BrokerOps;
use crate::config::CommMode;
use crate::error::AdminError;
use crate::exchange::ExchangeAdapter;
use crate::orchestrator::{resolve_mode, Orchestrator};
use crate::schemas::PnlStatus;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub ring: Arc<RecentRing>,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub admin_token: Arc<String>,
    pub started_at: Instant,
    pub ack_ttl_seconds: u64,
    pub comm_mode: CommMode,
}

pub fn build_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/orchestrate/run", post(orchestrate_run))
        .route("/orchestrate/stop", post(orchestrate_stop))
        .route("/pnl/status", get(pnl_status))
        .route("/admin/pnl/reset", post(pnl_reset))
        .route("/admin/orchestrate/halt", post(admin_halt))
        .route("/admin/orchestrate/unhalt", post(admin_unhalt))
        .route("/admin/streams/pending", get(streams_pending))
        .route("/admin/streams/dlq", get(streams_dlq))
        .route("/admin/streams/dlq/requeue", post(streams_dlq_requeue))
        .route("/admin/notify/ack", post(notify_ack))
        .route("/notify/recent", get(notify_recent))
        .layer(axum::middleware::from_fn_with_state(
            state.admin_token.clone(),
            token_gate,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(gated)
        .layer(axum::middleware::from_fn(
            crate::middleware::track_request_duration,
        ))
        .layer(axum::middleware::from_fn(
            crate::middleware::request_logging_simple,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn token_gate(
    State(token): State<Arc<String>>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    match auth::check(&headers, &token) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let broker_ok = state.orchestrator.broker().ping().await.is_ok();
    let uptime_seconds = state.started_at.elapsed().as_secs();
    Json(serde_json::json!({
        "status": if broker_ok { "ok" } else { "degraded" },
        "brokerOk": broker_ok,
        "uptimeSeconds": uptime_seconds,
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match crate::metrics::render(&state.orchestrator).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    symbol: String,
    mode: Option<String>,
}

async fn orchestrate_run(State(state): State<AppState>, Json(body): Json<RunRequest>) -> Response {
    let mode = resolve_mode(state.comm_mode, body.mode.as_deref());
    match mode {
        CommMode::Http | CommMode::Hybrid => match state.orchestrator.run_http(&body.symbol, state.adapter.clone(), None, None).await {
            Ok(result) => (StatusCode::ACCEPTED, Json(result)).into_response(),
            Err(AdminError::Halted) => halted_response(&state).await,
            Err(e @ AdminError::PipelineFailed(_)) => (StatusCode::BAD_GATEWAY, Json(error_body(&e))).into_response(),
            Err(e) => e.into_response(),
        },
        CommMode::Pubsub => match state.orchestrator.run_pubsub(&body.symbol, None, None).await {
            Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
            Err(AdminError::Halted) => halted_response(&state).await,
            Err(e) => e.into_response(),
        },
    }
}

async fn halted_response(state: &AppState) -> Response {
    let snapshot = state.orchestrator.pnl().status().await.unwrap_or(PnlStatus {
        start_equity: 0.0,
        realized: 0.0,
        percent: 0.0,
        daily_target_pct: 0.0,
        halted: true,
    });
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({"error": "halted", "detail": "daily_target_reached", "pnl": snapshot})),
    )
        .into_response()
}

fn error_body(e: &AdminError) -> serde_json::Value {
    serde_json::json!({"error": e.to_string()})
}

async fn orchestrate_stop(State(state): State<AppState>) -> Response {
    match state.orchestrator.halt("manual_stop").await {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({"status": "halt_command_emitted"}))).into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

async fn pnl_status(State(state): State<AppState>) -> Response {
    match state.orchestrator.pnl().status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

async fn pnl_reset(State(state): State<AppState>) -> Response {
    match state.orchestrator.pnl_reset().await {
        Ok(()) => Json(serde_json::json!({"status": "reset"})).into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct HaltRequest {
    reason: Option<String>,
}

async fn admin_halt(State(state): State<AppState>, body: Option<Json<HaltRequest>>) -> Response {
    let reason = body.and_then(|b| b.0.reason).unwrap_or_else(|| "manual_halt".to_string());
    match state.orchestrator.halt(&reason).await {
        Ok(()) => Json(serde_json::json!({"status": "halted"})).into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

async fn admin_unhalt(State(state): State<AppState>) -> Response {
    match state.orchestrator.unhalt().await {
        Ok(()) => Json(serde_json::json!({"status": "unhalted"})).into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    stream: String,
    group: String,
}

async fn streams_pending(State(state): State<AppState>, Query(q): Query<PendingQuery>) -> Response {
    match state.orchestrator.pending_summary(&q.stream, &q.group).await {
        Ok(summary) => Json(serde_json::json!({
            "count": summary.count,
            "smallestId": summary.smallest_id,
            "greatestId": summary.greatest_id,
            "perConsumer": summary.per_consumer,
        }))
        .into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    stream: String,
    #[serde(default = "default_start")]
    start: String,
    #[serde(default = "default_end")]
    end: String,
    #[serde(default = "default_count")]
    count: usize,
}

fn default_start() -> String {
    "-".to_string()
}
fn default_end() -> String {
    "+".to_string()
}
fn default_count() -> usize {
    50
}

#[derive(Serialize)]
struct DecodedDlqEntry {
    id: String,
    payload: serde_json::Value,
}

async fn streams_dlq(State(state): State<AppState>, Query(q): Query<DlqQuery>) -> Response {
    match state.orchestrator.dlq_list(&q.stream, &q.start, &q.end, q.count).await {
        Ok(entries) => {
            let decoded: Vec<DecodedDlqEntry> = entries
                .into_iter()
                .map(|e| DecodedDlqEntry { id: e.id, payload: e.payload })
                .collect();
            Json(decoded).into_response()
        }
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DlqRequeueRequest {
    #[serde(rename = "dlqStream")]
    dlq_stream: String,
    id: String,
}

async fn streams_dlq_requeue(State(state): State<AppState>, Json(body): Json<DlqRequeueRequest>) -> Response {
    match state.orchestrator.dlq_requeue(&body.dlq_stream, &body.id).await {
        Ok(()) => Json(serde_json::json!({"status": "requeued"})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest {
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

async fn notify_ack(State(state): State<AppState>, Json(body): Json<AckRequest>) -> Response {
    let Some(id) = body.request_id.or(body.trace_id) else {
        return AdminError::MissingField("traceId_or_requestId").into_response();
    };
    match notifier::ack(&state.orchestrator.broker(), &id, state.ack_ttl_seconds).await {
        Ok(()) => Json(serde_json::json!({"status": "acked"})).into_response(),
        Err(e) => AdminError::Internal(e).into_response(),
    }
}

async fn notify_recent(State(state): State<AppState>) -> Response {
    match notifier::recent_with_acks(&state.orchestrator.broker(), &state.ring).await {
        Ok(entries) => {
            let body: Vec<_> = entries
                .into_iter()
                .map(|(entry, acked)| serde_json::json!({"id": entry.ring_id, "event": entry.event, "acked": acked}))
                .collect();
            Json(body).into_response()
        }
        Err(e) => AdminError::Internal(e).into_response(),
    }
}
