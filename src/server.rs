//! HTTP server exposing the engine to dashboards and meter gateways.
//!
//! # Architecture
//!
//! ```text
//! Meter gateway ──→ POST /api/water/readings ──→ engine ──→ store
//!                                                  ↓
//! Dashboard ←── GET /api/water/usage ←── [Aggregation + Tips]
//! ```
//!
//! Meter-scoped routes take a `meterId` query parameter. Errors are JSON
//! `{ "error": ..., "code": ... }` bodies.

use crate::core::chains::ChainAnalysis;
use crate::core::event::WaterEvent;
use crate::core::tips::Recommendation;
use crate::core::window::Granularity;
use crate::engine::{EngineError, IngestOutcome, UsageReport, WaterUsageEngine};
use crate::classifier::{Anomaly, Classification, VerdictSource};
use crate::readings::{FlowSample, MeterId, Reading};
use crate::store::{EventFilter, Removed, Settings, SettingsPatch};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
    /// Save the store after every change
    pub persist: bool,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            persist: true,
        }
    }
}

/// Shared server state
struct ServerState {
    engine: Arc<WaterUsageEngine>,
    persist: bool,
}

impl ServerState {
    /// Save after a change; failures are logged, not returned.
    async fn save_changes(&self) {
        if !self.persist {
            return;
        }
        if let Err(e) = self.engine.save().await {
            tracing::warn!("Failed to save store: {}", e);
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub classifier: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn engine_error(e: EngineError) -> ApiError {
    let (status, code) = match e {
        EngineError::UnknownMeter(_) => (StatusCode::NOT_FOUND, "UNKNOWN_METER"),
        EngineError::EventNotFound(_) => (StatusCode::NOT_FOUND, "EVENT_NOT_FOUND"),
        EngineError::InvalidTimeWindow { .. } => (StatusCode::BAD_REQUEST, "INVALID_TIME_WINDOW"),
        EngineError::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        EngineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
    };
    api_error(status, code, e.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterQuery {
    meter_id: Option<String>,
}

impl MeterQuery {
    fn meter(&self) -> Result<MeterId, ApiError> {
        meter_from(self.meter_id.as_deref())
    }
}

fn meter_from(meter_id: Option<&str>) -> Result<MeterId, ApiError> {
    match meter_id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(MeterId::new(id)),
        _ => Err(api_error(
            StatusCode::BAD_REQUEST,
            "MISSING_METER",
            "meterId query parameter is required",
        )),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageQuery {
    meter_id: Option<String>,
    time_range: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl UsageQuery {
    fn granularity(&self) -> Result<Granularity, ApiError> {
        match self.time_range.as_deref() {
            None => Ok(Granularity::default()),
            Some(range) => range.parse::<Granularity>().map_err(|e| {
                api_error(StatusCode::BAD_REQUEST, "INVALID_TIME_RANGE", e.to_string())
            }),
        }
    }

    /// Explicit dates when both are given, else the preset ending now.
    fn window(&self, granularity: Granularity) -> (DateTime<Utc>, DateTime<Utc>) {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                let window = granularity.window_ending(self.end_date.unwrap_or_else(Utc::now));
                (window.start(), window.end())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    meter_id: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReadingsBody {
    One(Reading),
    Many(Vec<Reading>),
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    outcomes: Vec<IngestOutcome>,
}

#[derive(Debug, Deserialize)]
struct CategorizeBody {
    category: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagBody {
    is_anomaly: bool,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowBody {
    flow_data: Vec<FlowSample>,
}

#[derive(Debug, Serialize)]
struct ClassifyResponse {
    #[serde(flatten)]
    classification: Classification,
    /// True when the classifier was unavailable and fixed values were used
    fallback: bool,
}

#[derive(Debug, Serialize)]
struct AnomaliesResponse {
    anomalies: Vec<Anomaly>,
    details: String,
    fallback: bool,
}

#[derive(Debug, Serialize)]
struct RecommendationsResponse {
    recommendations: Vec<Recommendation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainBody {
    event_ids: Vec<u64>,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    message: String,
    removed: Removed,
}

/// GET /health
async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        classifier: state.engine.classifier().delegate_name().to_string(),
    })
}

/// POST /api/water/readings
///
/// Accepts a single reading or an array of readings for one meter.
async fn ingest_readings(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MeterQuery>,
    Json(body): Json<ReadingsBody>,
) -> ApiResult<IngestResponse> {
    let meter = query.meter()?;
    let readings = match body {
        ReadingsBody::One(reading) => vec![reading],
        ReadingsBody::Many(readings) => readings,
    };

    let mut outcomes = Vec::with_capacity(readings.len());
    for reading in readings {
        let outcome = state
            .engine
            .ingest_reading(&meter, reading.timestamp, reading.value)
            .await
            .map_err(engine_error)?;
        outcomes.push(outcome);
    }
    state.save_changes().await;

    Ok(Json(IngestResponse { outcomes }))
}

/// GET /api/water/usage
async fn usage(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<UsageReport> {
    let meter = meter_from(query.meter_id.as_deref())?;
    let granularity = query.granularity()?;
    let (start, end) = query.window(granularity);

    state
        .engine
        .usage_report(&meter, start, end, granularity)
        .await
        .map(Json)
        .map_err(engine_error)
}

/// GET /api/water/events
async fn list_events(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<WaterEvent>> {
    let meter = meter_from(query.meter_id.as_deref())?;
    let filter = EventFilter {
        start_date: query.start_date,
        end_date: query.end_date,
        category: query.category,
    };

    state
        .engine
        .list_events(&meter, &filter)
        .await
        .map(Json)
        .map_err(engine_error)
}

/// GET /api/water/events/:id
async fn get_event(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<u64>,
) -> ApiResult<WaterEvent> {
    state.engine.get_event(id).await.map(Json).map_err(engine_error)
}

/// PATCH /api/water/events/:id/categorize
async fn categorize_event(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<u64>,
    Json(body): Json<CategorizeBody>,
) -> ApiResult<WaterEvent> {
    let category = body.category.trim();
    if category.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_CATEGORY",
            "category must not be empty",
        ));
    }

    let event = state
        .engine
        .set_category(id, category)
        .await
        .map_err(engine_error)?;
    state.save_changes().await;
    Ok(Json(event))
}

/// PATCH /api/water/events/:id/flag
async fn flag_event(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<u64>,
    Json(body): Json<FlagBody>,
) -> ApiResult<WaterEvent> {
    let event = state
        .engine
        .set_anomaly_flag(id, body.is_anomaly, body.reason.as_deref())
        .await
        .map_err(engine_error)?;
    state.save_changes().await;
    Ok(Json(event))
}

/// POST /api/ai/categorize
async fn ai_categorize(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MeterQuery>,
    Json(body): Json<FlowBody>,
) -> ApiResult<ClassifyResponse> {
    let meter = query.meter()?;
    let verdict = state.engine.classify(&meter, &body.flow_data).await;
    Ok(Json(ClassifyResponse {
        fallback: verdict.source == VerdictSource::Fallback,
        classification: verdict.value,
    }))
}

/// POST /api/ai/anomalies
async fn ai_anomalies(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MeterQuery>,
    Json(body): Json<FlowBody>,
) -> ApiResult<AnomaliesResponse> {
    let meter = query.meter()?;
    let verdict = state.engine.detect_anomalies(&meter, &body.flow_data).await;
    let fallback = verdict.is_fallback();
    Ok(Json(AnomaliesResponse {
        anomalies: verdict.value.anomalies,
        details: verdict.value.details,
        fallback,
    }))
}

/// POST /api/ai/recommendations
async fn ai_recommendations(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<RecommendationsResponse> {
    let meter = meter_from(query.meter_id.as_deref())?;
    let granularity = query.granularity()?;
    let (start, end) = query.window(granularity);

    let recommendations = state
        .engine
        .recommendations(&meter, start, end)
        .await
        .map_err(engine_error)?;
    Ok(Json(RecommendationsResponse { recommendations }))
}

/// POST /api/ai/analyze-chain
async fn ai_analyze_chain(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChainBody>,
) -> ApiResult<ChainAnalysis> {
    state
        .engine
        .analyze_chain(&body.event_ids)
        .await
        .map(Json)
        .map_err(engine_error)
}

/// GET /api/settings
async fn get_settings(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MeterQuery>,
) -> ApiResult<Settings> {
    let meter = query.meter()?;
    Ok(Json(state.engine.settings(&meter).await))
}

/// PUT /api/settings
async fn put_settings(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MeterQuery>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Settings> {
    let meter = query.meter()?;
    let settings = state.engine.update_settings(&meter, &patch).await;
    state.save_changes().await;
    Ok(Json(settings))
}

/// POST /api/settings/reset
async fn reset_settings(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MeterQuery>,
) -> ApiResult<Settings> {
    let meter = query.meter()?;
    let settings = state.engine.reset_settings(&meter).await;
    state.save_changes().await;
    Ok(Json(settings))
}

/// DELETE /api/user/data
async fn delete_user_data(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MeterQuery>,
) -> ApiResult<DeleteResponse> {
    let meter = query.meter()?;
    let removed = state.engine.delete_all_user_data(&meter).await;
    state.save_changes().await;
    Ok(Json(DeleteResponse {
        message: "All user data deleted successfully".to_string(),
        removed,
    }))
}

/// Build the router over an engine.
pub fn router(engine: Arc<WaterUsageEngine>, persist: bool) -> Router {
    let state = Arc::new(ServerState { engine, persist });

    Router::new()
        .route("/health", get(health))
        .route("/api/water/readings", post(ingest_readings))
        .route("/api/water/usage", get(usage))
        .route("/api/water/events", get(list_events))
        .route("/api/water/events/:id", get(get_event))
        .route("/api/water/events/:id/categorize", patch(categorize_event))
        .route("/api/water/events/:id/flag", patch(flag_event))
        .route("/api/ai/categorize", post(ai_categorize))
        .route("/api/ai/anomalies", post(ai_anomalies))
        .route("/api/ai/recommendations", post(ai_recommendations))
        .route("/api/ai/analyze-chain", post(ai_analyze_chain))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/settings/reset", post(reset_settings))
        .route("/api/user/data", axum::routing::delete(delete_user_data))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    engine: Arc<WaterUsageEngine>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(engine, config.persist);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Water usage server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
