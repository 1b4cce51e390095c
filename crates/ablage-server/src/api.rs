use ablage_alert::{parse_expr, AlertEngine, Expr};
use ablage_core::{Labels, MetricKind, Sample};
use ablage_metrics::EngineMetrics;
use ablage_tsdb::{IncomingSample, Ingestor, SeriesRange, SeriesStore, TimeRange};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// HTTP 处理函数共享的状态
pub struct AppState {
    pub store: Arc<SeriesStore>,
    pub ingestor: Ingestor,
    pub engine: Arc<AlertEngine>,
    pub metrics: Arc<EngineMetrics>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(export_metrics))
        .route("/api/v1/samples", post(push_samples))
        .route("/api/v1/query_range", get(query_range))
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/rules", get(list_rules))
        .route("/api/v1/status", get(status))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

async fn push_samples(
    State(state): State<Arc<AppState>>,
    Json(samples): Json<Vec<IncomingSample>>,
) -> impl IntoResponse {
    let total = samples.len();
    let report = state.ingestor.push_batch(samples).await;
    debug!(total, accepted = report.accepted, rejected = report.rejected, "Samples pushed");

    let status = if total > 0 && report.accepted + report.expired == 0 {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

#[derive(Debug, Deserialize)]
pub struct QueryRangeParams {
    #[serde(rename = "match")]
    pub selector: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct SeriesResponse {
    metric: String,
    labels: Labels,
    kind: MetricKind,
    samples: Vec<Sample>,
}

impl From<SeriesRange> for SeriesResponse {
    fn from(range: SeriesRange) -> Self {
        Self {
            samples: range.iter().collect(),
            kind: range.kind,
            metric: range.id.name,
            labels: range.id.labels,
        }
    }
}

async fn query_range(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryRangeParams>,
) -> impl IntoResponse {
    let selector = match parse_expr(&params.selector) {
        Ok(Expr::Selector(selector)) => selector,
        Ok(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("match must be a series selector, got {}", other),
            )
        }
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(1));
    if start > end {
        return error_response(StatusCode::BAD_REQUEST, "start must not be after end");
    }

    let series: Vec<SeriesResponse> = state
        .store
        .query(&selector, TimeRange::new(start, end))
        .await
        .into_iter()
        .map(SeriesResponse::from)
        .collect();

    (StatusCode::OK, Json(serde_json::json!({ "series": series })))
}

async fn list_alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.active_alerts().await)
}

async fn list_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.rule_statuses().await)
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.store.stats().await;
    Json(serde_json::json!({
        "series": stats.series,
        "samples": stats.samples,
        "rule_groups": state.engine.groups().len(),
        "rules": state.engine.rule_count(),
    }))
}

async fn export_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}
