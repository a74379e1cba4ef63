//! Lectern HTTP surface
//!
//! Serves the WebSocket signaling endpoint, a health probe, and the thin
//! HTTP boundary to the upstream lecture record store. All signaling logic
//! lives in `lectern-signal`; this crate only moves messages between sockets
//! and the coordinator.

pub mod http;
pub mod lecture;

pub use http::{create_router, AppState};
pub use lecture::{HttpLectureStore, LectureStore, LocalLectureStore};
