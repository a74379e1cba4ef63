//! Lectern signaling core
//!
//! This crate implements the real-time signaling and session-coordination
//! subsystem for live lectures: one broadcaster (the host) streams audio and
//! video to many viewers through an SFU topology, coordinated over a
//! bidirectional message channel.
//!
//! ## Architecture
//!
//! - **`SessionCoordinator`**: message-driven front controller, one logical
//!   worker per peer connection
//! - **`RoomRegistry`**: per-room state machine (host, producers, viewers)
//! - **`TransportRegistry`**: per-peer engine transport ownership
//! - **`PeerIndex`**: per-connection resource indexes and heartbeat tracking
//! - **`RoomHub`**: ordered event fan-out to room members
//! - **`MediaEngine`**: the transport/codec engine behind a trait seam
//!   (`RtcEngine` for WebRTC, `MockEngine` for tests)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lectern_signal::{SessionCoordinator, engine::rtc::RtcEngine, config::Config};
//!
//! let config = Config::default();
//! let engine = RtcEngine::new(config.engine)?;
//! let coordinator = SessionCoordinator::new(engine, config.coordinator);
//! let peer_id = coordinator.connect("host", CancellationToken::new())?;
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod types;

pub use config::Config;
pub use coordinator::SessionCoordinator;
pub use engine::MediaEngine;
pub use error::{Result, SignalError};
pub use hub::RoomHub;
pub use types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId};
