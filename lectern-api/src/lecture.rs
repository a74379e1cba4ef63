//! Lecture record store boundary
//!
//! The surrounding application owns lecture CRUD; this subsystem only needs
//! `startLecture -> roomToken` and `endLecture`. The token handed back is
//! the room identifier used on the signaling channel; its authenticity is
//! the upstream authorization layer's problem, not ours.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use lectern_signal::config::LectureStoreConfig;
use lectern_signal::types::RoomId;

#[derive(Error, Debug)]
pub enum LectureStoreError {
    #[error("Lecture store request failed: {0}")]
    Request(String),

    #[error("Lecture store returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Boundary to the lecture record service
#[async_trait]
pub trait LectureStore: Send + Sync {
    /// Mark the lecture live and obtain its room token
    async fn start_lecture(&self, lecture_id: &str) -> Result<RoomId, LectureStoreError>;

    /// Mark the lecture over
    async fn end_lecture(&self, lecture_id: &str) -> Result<(), LectureStoreError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartLectureResponse {
    room_token: String,
}

/// HTTP client for the upstream lecture record service
pub struct HttpLectureStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLectureStore {
    pub fn new(config: &LectureStoreConfig) -> Result<Self, LectureStoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| LectureStoreError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LectureStore for HttpLectureStore {
    async fn start_lecture(&self, lecture_id: &str) -> Result<RoomId, LectureStoreError> {
        let url = format!("{}/lectures/{lecture_id}/start", self.base_url);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| LectureStoreError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| LectureStoreError::Request(e.to_string()))?;

        let body: StartLectureResponse = response
            .json()
            .await
            .map_err(|e| LectureStoreError::InvalidResponse(e.to_string()))?;

        info!(lecture_id = %lecture_id, "Lecture started upstream");
        Ok(RoomId::from(body.room_token))
    }

    async fn end_lecture(&self, lecture_id: &str) -> Result<(), LectureStoreError> {
        let url = format!("{}/lectures/{lecture_id}/end", self.base_url);
        self.client
            .post(&url)
            .send()
            .await
            .map_err(|e| LectureStoreError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| LectureStoreError::Request(e.to_string()))?;

        info!(lecture_id = %lecture_id, "Lecture ended upstream");
        Ok(())
    }
}

/// Local token generation for deployments without the upstream service
/// (and for tests)
#[derive(Debug, Default)]
pub struct LocalLectureStore;

#[async_trait]
impl LectureStore for LocalLectureStore {
    async fn start_lecture(&self, lecture_id: &str) -> Result<RoomId, LectureStoreError> {
        let token = RoomId::new();
        info!(lecture_id = %lecture_id, room_token = %token, "Lecture started locally");
        Ok(token)
    }

    async fn end_lecture(&self, lecture_id: &str) -> Result<(), LectureStoreError> {
        info!(lecture_id = %lecture_id, "Lecture ended locally");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_store_mints_unique_tokens() {
        let store = LocalLectureStore;
        let first = store.start_lecture("lecture-1").await.expect("start");
        let second = store.start_lecture("lecture-1").await.expect("start");
        assert_ne!(first, second);
        store.end_lecture("lecture-1").await.expect("end");
    }

    #[test]
    fn test_http_store_strips_trailing_slash() {
        let store = HttpLectureStore::new(&LectureStoreConfig {
            base_url: "http://records.internal/".to_string(),
            request_timeout_seconds: 5,
        })
        .expect("client builds");
        assert_eq!(store.base_url, "http://records.internal");
    }
}
