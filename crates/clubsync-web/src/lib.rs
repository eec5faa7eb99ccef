//! JSON API over the import pipeline: submit imports, inspect jobs and read
//! back imported club data.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use clubsync_storage::ImportStore;
use clubsync_sync::ops;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "clubsync-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ImportStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ImportStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize)]
struct AutoImportBody {
    enabled: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/clubs/{club_id}", get(club_handler))
        .route("/api/clubs/{club_id}/import", post(submit_import_handler))
        .route("/api/clubs/{club_id}/events", get(club_events_handler))
        .route("/api/clubs/{club_id}/members", get(club_members_handler))
        .route("/api/clubs/{club_id}/auto-import", put(auto_import_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    match ops::current_jobs(state.store.as_ref(), query.limit.unwrap_or(50)).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn club_handler(State(state): State<Arc<AppState>>, Path(club_id): Path<String>) -> Response {
    match state.store.club(&club_id).await {
        Ok(Some(club)) => Json(club).into_response(),
        Ok(None) => not_found(format!("club {club_id} is not known")),
        Err(err) => server_error(err),
    }
}

async fn submit_import_handler(
    State(state): State<Arc<AppState>>,
    Path(club_id): Path<String>,
) -> Response {
    if club_id.trim().is_empty() {
        return bad_request("club id must not be empty");
    }
    match ops::submit_club_import(state.store.as_ref(), &club_id).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn club_events_handler(
    State(state): State<Arc<AppState>>,
    Path(club_id): Path<String>,
) -> Response {
    match ops::club_events(state.store.as_ref(), &club_id).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err),
    }
}

async fn club_members_handler(
    State(state): State<Arc<AppState>>,
    Path(club_id): Path<String>,
) -> Response {
    match ops::club_members(state.store.as_ref(), &club_id).await {
        Ok(members) => Json(members).into_response(),
        Err(err) => server_error(err),
    }
}

async fn auto_import_handler(
    State(state): State<Arc<AppState>>,
    Path(club_id): Path<String>,
    Json(body): Json<AutoImportBody>,
) -> Response {
    if club_id.trim().is_empty() {
        return bad_request("club id must not be empty");
    }
    match ops::set_auto_import(state.store.as_ref(), &club_id, body.enabled).await {
        Ok(()) => Json(json!({ "club_id": club_id.trim(), "auto_import": body.enabled })).into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() }))).into_response()
}

fn not_found(message: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message.into() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
