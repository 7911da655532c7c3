//! Balancer HTTP API
//!
//! Client-facing endpoints. Backend replies are passed through with
//! the status the backend sent.

use std::sync::Arc;
use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;

use super::backend::ForwardedResponse;
use super::router::{ConfigResult, ListedExam, LoadBalancer};
use crate::exam::api::{json_body, StartExamRequest};
use crate::exam::{ExamConfig, ExamResult};
use crate::error::{Error, Result};

/// Build the balancer router
pub fn router(balancer: Arc<LoadBalancer>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/start_exam", post(handle_start_exam))
        .route("/submit_answer", post(handle_submit_answer))
        .route("/configure_exam_all", post(handle_configure_all))
        .route("/exams", get(handle_exams))
        .route("/results", get(handle_results))
        .route("/lb/status", get(handle_status))
        .with_state(balancer)
}

#[derive(Debug, Serialize)]
struct ConfigureAllResponse {
    results: Vec<ConfigResult>,
}

#[derive(Debug, Serialize)]
struct ExamsResponse {
    exams: Vec<ListedExam>,
}

#[derive(Debug, Serialize)]
struct ResultsResponse {
    results: Vec<ExamResult>,
}

fn passthrough(response: ForwardedResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(response.body)).into_response()
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_start_exam(
    State(lb): State<Arc<LoadBalancer>>,
    payload: std::result::Result<Json<StartExamRequest>, JsonRejection>,
) -> Result<Response> {
    let request = json_body(payload)?;
    let response = lb.route_new_session(request.username.as_deref()).await?;
    Ok(passthrough(response))
}

async fn handle_submit_answer(
    State(lb): State<Arc<LoadBalancer>>,
    payload: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Response> {
    let body = json_body(payload)?;
    let session_id = body
        .get("session_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::BadRequest("session_id is required".into()))?
        .to_string();

    let response = lb.route_existing_session(&session_id, &body).await?;
    Ok(passthrough(response))
}

async fn handle_configure_all(
    State(lb): State<Arc<LoadBalancer>>,
    payload: std::result::Result<Json<ExamConfig>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let config = json_body(payload).map_err(|e| Error::InvalidExamConfig(e.to_string()))?;
    let results = lb.propagate_config(&config).await?;
    Ok(Json(ConfigureAllResponse { results }))
}

async fn handle_exams(State(lb): State<Arc<LoadBalancer>>) -> impl IntoResponse {
    Json(ExamsResponse {
        exams: lb.fetch_exam_infos().await,
    })
}

async fn handle_results(State(lb): State<Arc<LoadBalancer>>) -> impl IntoResponse {
    Json(ResultsResponse {
        results: lb.fetch_results().await,
    })
}

async fn handle_status(State(lb): State<Arc<LoadBalancer>>) -> impl IntoResponse {
    Json(lb.stats().await)
}
