//! JSON API: service and source health, source, run and posting listings, and
//! the manual scrape trigger.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use harvest_core::{Run, RunStatus, Source};
use harvest_storage::{PostingFilter, RecordStore, RunFilter, SourceFilter, StoreError};
use harvest_sync::{Dispatcher, TriggerError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-web";

/// Runs shown on a source detail response.
const RECENT_RUNS: i64 = 10;

const DEFAULT_PAGE: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub listings_found: i32,
    pub listings_new: i32,
    pub listings_updated: i32,
    pub listings_removed: i32,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            started_at: run.started_at,
            listings_found: run.listings_found,
            listings_new: run.listings_new,
            listings_updated: run.listings_updated,
            listings_removed: run.listings_removed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: Uuid,
    pub platform: String,
    pub base_url: String,
    pub active: bool,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub last_listing_count: i32,
    pub last_error: Option<String>,
    pub latest_run: Option<RunSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceDetail {
    #[serde(flatten)]
    pub source: Source,
    pub recent_runs: Vec<Run>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeAccepted {
    pub task_id: Uuid,
    pub source_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    pub database: HealthCheck,
    /// Sources with an ingestion task currently running.
    pub sources_in_flight: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedHealth {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesQuery {
    pub platform: Option<String>,
    pub active: Option<bool>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_page")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostingsQuery {
    pub source_id: Option<Uuid>,
    pub platform: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub search: Option<String>,
    #[serde(default = "default_true")]
    pub active_only: bool,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_page")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_true")]
    pub active_only: bool,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunsQuery {
    pub source_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_run_limit")]
    pub limit: i64,
}

fn default_run_limit() -> i64 {
    RunFilter::default().limit
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_health_handler))
        .route("/health/sources", get(sources_health_handler))
        .route("/sources", get(sources_handler))
        .route("/sources/{id}", get(source_detail_handler))
        .route("/sources/{id}/scrape", post(scrape_handler))
        .route("/runs", get(runs_handler))
        .route("/runs/{id}", get(run_detail_handler))
        .route("/postings", get(postings_handler))
        .route("/postings/stats", get(posting_stats_handler))
        .route("/postings/{id}", get(posting_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy", "app": "harvest" }))
}

/// 503 when the store cannot be reached.
async fn detailed_health_handler(State(state): State<Arc<AppState>>) -> Response {
    let database = match state.store.ping().await {
        Ok(()) => HealthCheck {
            ok: true,
            message: None,
        },
        Err(err) => {
            error!(error = %err, "store health check failed");
            HealthCheck {
                ok: false,
                message: Some(err.to_string()),
            }
        }
    };
    let status = if database.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = DetailedHealth {
        status: if database.ok { "healthy" } else { "degraded" },
        timestamp: Utc::now(),
        checks: HealthChecks {
            database,
            sources_in_flight: state.dispatcher.in_flight_sources().len(),
        },
    };
    (status, Json(body)).into_response()
}

async fn sources_health_handler(State(state): State<Arc<AppState>>) -> Response {
    let sources = match state.store.list_sources(&SourceFilter::default()).await {
        Ok(sources) => sources,
        Err(err) => return server_error(err),
    };
    let mut health = Vec::with_capacity(sources.len());
    for source in sources {
        let latest_run = match state
            .store
            .list_runs(&RunFilter::for_source(source.id, 1))
            .await
        {
            Ok(runs) => runs.first().map(RunSummary::from),
            Err(err) => return server_error(err),
        };
        health.push(SourceHealth {
            source_id: source.id,
            platform: source.platform,
            base_url: source.base_url,
            active: source.active,
            last_attempted_at: source.last_attempted_at,
            last_success_at: source.last_success_at,
            consecutive_failures: source.consecutive_failures,
            last_listing_count: source.last_listing_count,
            last_error: source.last_error,
            latest_run,
        });
    }
    Json(health).into_response()
}

async fn sources_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourcesQuery>,
) -> Response {
    let filter = SourceFilter {
        platform: query.platform,
        active: query.active,
        skip: query.skip,
        limit: Some(query.limit),
    };
    match state.store.list_sources(&filter).await {
        Ok(sources) => Json(sources).into_response(),
        Err(err) => server_error(err),
    }
}

async fn source_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let source = match state.store.get_source(id).await {
        Ok(Some(source)) => source,
        Ok(None) => return not_found("source", id),
        Err(err) => return server_error(err),
    };
    match state
        .store
        .list_runs(&RunFilter::for_source(id, RECENT_RUNS))
        .await
    {
        Ok(recent_runs) => Json(SourceDetail {
            source,
            recent_runs,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.dispatcher.trigger(id).await {
        Ok(handle) => (
            StatusCode::ACCEPTED,
            Json(ScrapeAccepted {
                task_id: handle.task_id,
                source_id: handle.source_id,
                message: "scrape queued".to_string(),
            }),
        )
            .into_response(),
        Err(TriggerError::NotFound(id)) => not_found("source", id),
        Err(err @ TriggerError::Inactive(_)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(TriggerError::Store(err)) => server_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let filter = RunFilter {
        source_id: query.source_id,
        status: query.status,
        skip: query.skip,
        limit: query.limit,
    };
    match state.store.list_runs(&filter).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.get_run(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => not_found("run", id),
        Err(err) => server_error(err),
    }
}

async fn postings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostingsQuery>,
) -> Response {
    let filter = PostingFilter {
        source_id: query.source_id,
        platform: query.platform,
        state: query.state,
        city: query.city,
        search: query.search,
        active: query.active_only.then_some(true),
        skip: query.skip,
        limit: query.limit,
    };
    match state.store.list_postings(&filter).await {
        Ok(postings) => Json(postings).into_response(),
        Err(err) => server_error(err),
    }
}

async fn posting_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    match state.store.posting_stats(query.active_only).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn posting_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.get_posting(id).await {
        Ok(Some(posting)) => Json(posting).into_response(),
        Ok(None) => not_found("posting", id),
        Err(err) => server_error(err),
    }
}

fn not_found(kind: &str, id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("{kind} {id} not found") })),
    )
        .into_response()
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
