//! HTTP plumbing shared by the node API and the balancer API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() && !matches!(self, Error::NoHealthyBackend | Error::CapacityExceeded) {
            tracing::warn!("Request failed: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}

/// Add tracing (and optionally permissive CORS) to a router
pub fn with_layers(router: Router, cors_enabled: bool) -> Router {
    let router = router.layer(TraceLayer::new_for_http());
    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Serve `router` until `shutdown` flips to `true`
pub async fn serve(listener: TcpListener, router: Router, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!("HTTP API listening on {}", local);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("HTTP API on {} stopped", local);
    Ok(())
}
