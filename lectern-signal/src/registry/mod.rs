//! Shared-state registries
//!
//! These maps are the only shared-mutable state in the subsystem. Room state
//! sits behind a per-room mutex that is never held across an await; the
//! engine-call discipline (validate, release, call, re-validate, commit)
//! lives in the coordinator.

pub mod peer;
pub mod room;
pub mod transport;

pub use peer::{PeerIndex, PeerRole};
pub use room::RoomRegistry;
pub use transport::{TransportRecord, TransportRegistry};
