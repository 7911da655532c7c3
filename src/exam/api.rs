//! Node HTTP API
//!
//! Health, load and exam endpoints the balancer and students talk to,
//! plus a status view of the coordination layer.

use std::sync::Arc;
use axum::{
    extract::{rejection::JsonRejection, Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use super::store::{ExamConfig, ExamStore};
use crate::clock::{BerkeleyClock, ClockStatus};
use crate::election::{BullyElection, ElectionStatus};
use crate::state::{NodeRecord, RegistrySummary};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    pub node_id: String,
    pub store: Arc<ExamStore>,
    pub clock: BerkeleyClock,
    pub election: BullyElection,
}

/// Build the node router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/status", get(handle_status))
        .route("/configure_exam", post(handle_configure))
        .route("/exam_info", get(handle_exam_info))
        .route("/results", get(handle_results))
        .route("/start_exam", post(handle_start_exam))
        .route("/submit_answer", post(handle_submit_answer))
        .with_state(state)
}

// ============ Request/Response Types ============

/// Start exam request
#[derive(Debug, Serialize, Deserialize)]
pub struct StartExamRequest {
    pub username: Option<String>,
}

/// Submit answer request
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitAnswerRequest {
    pub session_id: Option<String>,
    pub answer: Option<String>,
    #[serde(default)]
    pub question_id: Option<u32>,
}

/// Metrics response
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub node_id: String,
    pub active_sessions: usize,
    pub capacity: usize,
    /// Coordinator as seen by this node
    pub leader_id: Option<String>,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub clock: ClockStatus,
    pub election: ElectionStatus,
    pub registry: RegistrySummary,
    pub nodes: Vec<NodeRecord>,
}

/// Results response
#[derive(Debug, Serialize)]
pub struct ResultsResponse<T> {
    pub results: Vec<T>,
}

/// Unwrap a JSON body, turning axum's rejection into our 400
pub(crate) fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| Error::BadRequest(rejection.body_text()))
}

// ============ Handlers ============

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = state.store.metrics().await;
    let leader_id = state.election.current_leader().await.map(|l| l.id);

    Json(MetricsResponse {
        node_id: state.node_id.clone(),
        active_sessions: metrics.active_sessions,
        capacity: metrics.capacity,
        leader_id,
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.election.registry();

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        clock: state.clock.snapshot().await,
        election: state.election.snapshot().await,
        registry: registry.summary().await,
        nodes: registry.all_nodes().await,
    })
}

async fn handle_configure(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ExamConfig>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let config = json_body(payload).map_err(|e| Error::InvalidExamConfig(e.to_string()))?;
    let ack = state.store.configure(config).await?;
    Ok(Json(ack))
}

async fn handle_exam_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.info().await)
}

async fn handle_results(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ResultsResponse {
        results: state.store.results().await,
    })
}

async fn handle_start_exam(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<StartExamRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let request = json_body(payload)?;
    let username = request
        .username
        .ok_or_else(|| Error::BadRequest("username is required".into()))?;

    let started = state.store.start_session(&username).await?;
    Ok(Json(started))
}

async fn handle_submit_answer(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<SubmitAnswerRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let request = json_body(payload)?;
    let session_id = request.session_id.unwrap_or_default();

    let outcome = state
        .store
        .submit_answer(&session_id, request.answer.as_deref())
        .await?;
    Ok(Json(outcome))
}
