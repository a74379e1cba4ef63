//! Health check endpoint
//!
//! Simple liveness probe with coordinator counters for monitoring.

use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::http::AppState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub rooms: usize,
    pub peers: usize,
    pub transports: usize,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        rooms: state.coordinator.room_count(),
        peers: state.coordinator.peer_count(),
        transports: state.coordinator.transport_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_shape() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_seconds: 5,
            rooms: 1,
            peers: 2,
            transports: 3,
        };
        let json = serde_json::to_value(&response).expect("serialize");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["uptimeSeconds"], 5);
        assert_eq!(json["transports"], 3);
    }
}
