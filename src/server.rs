//! HTTP surface: REST routes plus the report-generation SSE stream.
//!
//! Handlers validate parameters at the boundary, guard every provider call
//! behind the rate limiter, and map the error taxonomy onto status codes:
//! 400 validation, 404 missing, 501 unimplemented capability, 502 provider
//! fatal, 503 provider transient.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use garde::Validate;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::cache::{HomeCache, RefreshOptions};
use crate::error::ProviderError;
use crate::limiter::RateLimiter;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{RefreshPipeline, RunState};
use crate::progress::{self, ProgressEvent};
use crate::provider::{GenerateParams, MarketProvider, ModelAnalyzer, ProviderKind};
use crate::reports::ReportStore;
use crate::universe::{is_valid_symbol, SymbolUniverse};

/// Strategy the pre-multistrategy routes (`/api/reports`, `/api/generate`)
/// map onto.
const LEGACY_STRATEGY: &str = "put_credit_spread";

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn MarketProvider>,
    pub analyzer: Arc<dyn ModelAnalyzer>,
    pub limiter: Arc<RateLimiter>,
    pub universe: Arc<SymbolUniverse>,
    pub reports: Arc<ReportStore>,
    pub cache: Arc<HomeCache>,
    pub orchestrator: Arc<Orchestrator>,
    pub pipeline: Arc<RefreshPipeline>,
    pub generate_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/reports", get(list_reports_legacy))
        .route("/api/strategies/{id}/reports", get(list_reports))
        .route("/api/strategies/{id}/reports/{name}", get(get_report))
        .route("/api/generate", get(generate_legacy))
        .route("/api/strategies/{id}/generate", get(generate))
        .route("/api/stock/scanner", get(stock_scanner))
        .route("/api/decisions/reject", post(reject_decision))
        .route("/api/decisions/{report_file}", get(get_decisions))
        .route("/api/regime", get(get_regime))
        .route("/api/playbook", get(get_playbook))
        .route("/api/health/sources", get(get_source_health))
        .route("/api/model/analyze", post(analyze_trade))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/refresh", post(start_refresh))
        .route("/api/refresh/stop", post(stop_refresh))
        .route("/api/symbols", get(get_symbols).post(add_symbol))
        .route("/api/symbols/{symbol}", axum::routing::delete(remove_symbol))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        let status = match &e {
            ProviderError::Transient(_)
            | ProviderError::Timeout(_)
            | ProviderError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ProviderError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ProviderError::Fatal(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult<Json<Value>> {
    Ok(Json(
        serde_json::to_value(value).map_err(|e| ApiError::from(anyhow::Error::from(e)))?,
    ))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

async fn list_reports_legacy(state: State<AppState>) -> ApiResult<Json<Vec<String>>> {
    list_reports(state, Path(LEGACY_STRATEGY.to_string())).await
}

async fn list_reports(
    State(state): State<AppState>,
    Path(strategy_id): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.reports.list_reports(&strategy_id)?))
}

async fn get_report(
    State(state): State<AppState>,
    Path((strategy_id, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    match state.reports.get_report(&strategy_id, &name) {
        Ok(payload) => to_json(&payload),
        Err(local_err) => {
            // Not on disk; the provider may host it upstream.
            let cancel = CancellationToken::new();
            let fetched = state
                .limiter
                .run_step(ProviderKind::Tradier, "fetch_report", &cancel, || {
                    let p = state.provider.clone();
                    let strategy_id = strategy_id.clone();
                    let name = name.clone();
                    async move { p.fetch_report(&strategy_id, &name).await }
                })
                .await;
            match fetched {
                Ok(out) => Ok(Json(out.value)),
                Err(_) => Err(ApiError::not_found(format!("Report not found: {local_err}"))),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Generation SSE
// ---------------------------------------------------------------------------

async fn generate_legacy(
    state: State<AppState>,
    query: Query<HashMap<String, String>>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    generate(state, Path(LEGACY_STRATEGY.to_string()), query).await
}

async fn generate(
    State(state): State<AppState>,
    Path(strategy_id): Path<String>,
    Query(raw): Query<HashMap<String, String>>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let params = parse_generate_params(&state, raw)?;

    let rx = progress::spawn_generate(
        state.provider.clone(),
        state.limiter.clone(),
        state.reports.clone(),
        strategy_id,
        params,
        state.generate_timeout,
    );

    // Close the SSE stream right after the terminal event.
    let stream = ReceiverStream::new(rx)
        .scan(false, |terminated, event: ProgressEvent| {
            let next = if *terminated {
                None
            } else {
                *terminated = event.is_terminal();
                Some(event)
            };
            futures::future::ready(next)
        })
        .map(|event| Event::default().event(event.event_name()).json_data(&event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Split a generate query into typed fields plus pass-through filters.
fn parse_generate_params(
    state: &AppState,
    mut raw: HashMap<String, String>,
) -> ApiResult<GenerateParams> {
    let preset = raw.remove("preset");
    let advanced_enabled = raw
        .remove("advanced_enabled")
        .is_some_and(|v| v == "true" || v == "1");

    let symbols = match raw.remove("symbols") {
        Some(csv) if !csv.trim().is_empty() => {
            let symbols: Vec<String> = csv
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            for s in &symbols {
                if !is_valid_symbol(s) {
                    return Err(ApiError::bad_request(format!("Invalid symbol: {s}")));
                }
            }
            symbols
        }
        _ => state.universe.get(),
    };

    Ok(GenerateParams {
        preset,
        symbols,
        advanced_enabled,
        filters: raw,
    })
}

// ---------------------------------------------------------------------------
// Scanners & market data
// ---------------------------------------------------------------------------

async fn stock_scanner(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let symbols = state.universe.get();
    let cancel = CancellationToken::new();
    let out = state
        .limiter
        .run_step(ProviderKind::Finnhub, "stock_scanner", &cancel, || {
            let p = state.provider.clone();
            let symbols = symbols.clone();
            let cancel = cancel.clone();
            async move { p.fetch_stock_scanner(&symbols, &cancel).await }
        })
        .await?;
    let payload = out.value;
    Ok(Json(json!({
        "candidates": payload.candidates,
        "report_stats": payload.report_stats,
        "notes": payload.notes,
        "source_health": payload.source_health,
    })))
}

async fn get_regime(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cancel = CancellationToken::new();
    let out = state
        .limiter
        .run_step(ProviderKind::Finnhub, "regime", &cancel, || {
            let p = state.provider.clone();
            async move { p.get_regime().await }
        })
        .await?;
    to_json(&out.value)
}

async fn get_playbook(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cancel = CancellationToken::new();
    let out = state
        .limiter
        .run_step(ProviderKind::Finnhub, "playbook", &cancel, || {
            let p = state.provider.clone();
            async move { p.get_playbook().await }
        })
        .await?;
    to_json(&out.value)
}

async fn get_source_health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cancel = CancellationToken::new();
    let out = state
        .limiter
        .run_step(ProviderKind::Fred, "source_health", &cancel, || {
            let p = state.provider.clone();
            async move { p.get_source_health().await }
        })
        .await?;
    to_json(&out.value)
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
struct RejectBody {
    #[garde(length(min = 1, max = 200))]
    trade_key: String,
    #[garde(length(min = 1, max = 10))]
    #[allow(dead_code)]
    symbol: String,
    #[garde(length(min = 1, max = 60))]
    #[allow(dead_code)]
    strategy: String,
    #[garde(length(min = 1, max = 120))]
    report_file: String,
    #[garde(length(min = 1, max = 500))]
    reason: String,
}

async fn reject_decision(
    State(state): State<AppState>,
    Json(body): Json<RejectBody>,
) -> ApiResult<Json<Value>> {
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {e}")))?;
    let recorded = state
        .reports
        .persist_reject(&body.report_file, &body.trade_key, &body.reason)?;
    Ok(Json(json!({ "ok": true, "recorded": recorded })))
}

async fn get_decisions(
    State(state): State<AppState>,
    Path(report_file): Path<String>,
) -> ApiResult<Json<Value>> {
    let decisions = state.reports.get_decisions(&report_file)?;
    Ok(Json(json!({ "decisions": decisions })))
}

// ---------------------------------------------------------------------------
// Model analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    trade: Value,
    #[serde(default)]
    source: String,
}

async fn analyze_trade(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> ApiResult<Json<Value>> {
    if !body.trade.is_object() {
        return Err(ApiError::bad_request("trade must be an object"));
    }
    let cancel = CancellationToken::new();
    let out = state
        .limiter
        .run_step(ProviderKind::Model, "analyze_trade", &cancel, || {
            let analyzer = state.analyzer.clone();
            let trade = body.trade.clone();
            let source = body.source.clone();
            async move { analyzer.analyze_trade(&trade, &source).await }
        })
        .await?;

    let mut evaluated_trade = body.trade.clone();
    if let Some(obj) = evaluated_trade.as_object_mut() {
        obj.insert(
            "model_evaluation".to_string(),
            serde_json::to_value(&out.value).map_err(anyhow::Error::from)?,
        );
    }
    Ok(Json(json!({ "ok": true, "evaluated_trade": evaluated_trade })))
}

// ---------------------------------------------------------------------------
// Snapshot & refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct SnapshotQuery {
    #[serde(default)]
    refresh: bool,
    #[serde(default)]
    home_only: bool,
}

async fn get_snapshot(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<Json<Value>> {
    let snapshot = if query.refresh {
        state
            .cache
            .refresh_silent(RefreshOptions {
                force: false,
                home_only: query.home_only,
            })
            .await
    } else {
        state.cache.get_snapshot()
    };
    to_json(&*snapshot)
}

async fn start_refresh(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let pipeline = state.pipeline.clone();
    match pipeline.state() {
        RunState::Running | RunState::Stopping => {
            Err(ApiError::conflict("refresh pipeline already running"))
        }
        _ => {
            tokio::spawn(async move {
                if let Err(e) = pipeline.run().await {
                    tracing::warn!("refresh pipeline did not start: {e}");
                }
            });
            Ok(Json(json!({ "started": true })))
        }
    }
}

async fn stop_refresh(State(state): State<AppState>) -> Json<Value> {
    state.pipeline.stop();
    Json(json!({ "stopping": true }))
}

// ---------------------------------------------------------------------------
// Symbol universe
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
struct SymbolBody {
    #[garde(pattern(r"^[A-Za-z^]{1,6}$"))]
    symbol: String,
}

async fn get_symbols(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "symbols": state.universe.get() }))
}

async fn add_symbol(
    State(state): State<AppState>,
    Json(body): Json<SymbolBody>,
) -> ApiResult<Json<Value>> {
    body.validate()
        .map_err(|e| ApiError::bad_request(format!("Validation error: {e}")))?;
    let added = state.universe.add(&body.symbol);
    Ok(Json(
        json!({ "ok": true, "added": added, "symbols": state.universe.get() }),
    ))
}

async fn remove_symbol(State(state): State<AppState>, Path(symbol): Path<String>) -> Json<Value> {
    let removed = state.universe.remove(&symbol);
    Json(json!({ "ok": true, "removed": removed, "symbols": state.universe.get() }))
}
