//! HTTP router and shared handler state

pub mod health;
pub mod websocket;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use axum::extract::{Path, State};
use lectern_signal::SessionCoordinator;
use tracing::error;

use crate::lecture::LectureStore;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub lecture_store: Arc<dyn LectureStore>,
    pub started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(coordinator: Arc<SessionCoordinator>, lecture_store: Arc<dyn LectureStore>) -> Self {
        Self {
            coordinator,
            lecture_store,
            started_at: Instant::now(),
        }
    }
}

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Build the HTTP router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/lectures/{lecture_id}/start", post(start_lecture))
        .route("/api/lectures/{lecture_id}/end", post(end_lecture))
        .route("/ws/lecture", get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartLectureHttpResponse {
    room_token: String,
}

/// Proxy to the lecture record store: mark a lecture live and hand the room
/// token back to the host UI
async fn start_lecture(
    State(state): State<AppState>,
    Path(lecture_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let room_token = state
        .lecture_store
        .start_lecture(&lecture_id)
        .await
        .map_err(|e| {
            error!(lecture_id = %lecture_id, error = %e, "start_lecture failed");
            AppError::internal_server_error(e.to_string())
        })?;

    Ok(Json(StartLectureHttpResponse {
        room_token: room_token.as_str().to_string(),
    }))
}

/// Proxy to the lecture record store: mark a lecture over
async fn end_lecture(
    State(state): State<AppState>,
    Path(lecture_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state
        .lecture_store
        .end_lecture(&lecture_id)
        .await
        .map_err(|e| {
            error!(lecture_id = %lecture_id, error = %e, "end_lecture failed");
            AppError::internal_server_error(e.to_string())
        })?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::bad_request("missing peerName");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("missing peerName"));
    }

    #[test]
    fn test_error_response_shape() {
        let body = ErrorResponse {
            error: "nope".to_string(),
            status: 500,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["error"], "nope");
        assert_eq!(json["status"], 500);
    }
}
