//! Media engine abstraction
//!
//! The transport engine (ICE/DTLS/SRTP negotiation, RTP forwarding) is a
//! collaborator behind this trait seam. The coordinator only ever sees
//! engine-assigned identifiers and opaque parameter blobs; codec and
//! transport internals stay on the engine side of the boundary.

pub mod mock;
pub mod rtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};

/// One codec supported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    /// e.g. "audio/opus", "video/VP8"
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    /// Codec-specific parameters, opaque to the signaling layer
    #[serde(default)]
    pub parameters: Value,
}

/// The engine's codec/capability descriptor, exchanged once per peer before
/// producing or consuming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// Whether these capabilities can receive the given codec
    #[must_use]
    pub fn supports(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|codec| codec.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// A freshly allocated engine transport
#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub id: TransportId,
    pub direction: TransportDirection,
    /// Opaque connection parameters for the peer-side handshake
    pub parameters: Value,
}

/// A live engine producer (one inbound media track from the host)
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// A live engine consumer (one outbound media track to a viewer), created in
/// resumed state
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    /// Opaque parameters the viewer's local engine needs to finish setup
    pub rtp_parameters: Value,
}

/// Engine-originated lifecycle notifications. These race with
/// signaling-level cleanup by design, which is why every close path in the
/// registries is idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The media for a producer stopped at the engine level (track ended)
    ProducerClosed { producer_id: ProducerId },
    /// A transport died at the engine level (ICE failure, peer-side close)
    TransportClosed { transport_id: TransportId },
}

/// The media engine seam.
///
/// All close operations are idempotent: both engine-side callbacks and
/// disconnect cleanup may race to close the same resource, and the second
/// close must be a no-op.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Engine codec capabilities. Fails with `EngineNotReady` before engine
    /// start-up has completed; a pure read afterwards.
    fn capabilities(&self) -> Result<RtpCapabilities>;

    /// Allocate a transport for one direction of one peer
    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportHandle>;

    /// Complete (or renegotiate) the handshake for a transport. Returns the
    /// engine's opaque answer blob, `Value::Null` if the engine has nothing
    /// to say back.
    async fn connect_transport(&self, transport_id: &TransportId, remote: Value) -> Result<Value>;

    /// Create a producer on a send transport
    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ProducerHandle>;

    /// Create a consumer on a receive transport, bound to a producer
    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<ConsumerHandle>;

    /// Release a transport and everything flowing over it
    async fn close_transport(&self, transport_id: &TransportId);

    /// Release a producer
    fn close_producer(&self, producer_id: &ProducerId);

    /// Release a consumer
    fn close_consumer(&self, consumer_id: &ConsumerId);

    /// Take the engine's lifecycle event stream. Yields `Some` exactly once;
    /// the coordinator consumes it to cascade engine-side closes into the
    /// registries.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_support_check() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: Value::Null,
            }],
        };
        assert!(caps.supports("video/vp8"));
        assert!(!caps.supports("audio/opus"));
    }

    #[test]
    fn test_capabilities_serde_shape() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: Some(2),
                parameters: Value::Null,
            }],
        };
        let value = serde_json::to_value(&caps).expect("capabilities should serialize");
        assert_eq!(value["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(value["codecs"][0]["clockRate"], 48000);
        assert_eq!(value["codecs"][0]["channels"], 2);
    }
}
