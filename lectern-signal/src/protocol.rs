//! Wire protocol for the signaling channel
//!
//! Every client request carries a correlation `id` and expects exactly one
//! acknowledgement with that `id`, carrying either the success payload or a
//! structured error. Server-initiated events share the same ordered outbound
//! channel but carry no `id`; they are not responses to any pending request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalError;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

/// Role a peer holds inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Viewer,
}

/// Publicly visible participant descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub role: ParticipantRole,
}

/// Publicly visible producer descriptor, announced to viewers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: PeerId,
}

/// User-supplied info attached to a join request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub display_name: String,
}

/// Client request envelope: `{ "id": 7, "type": "...", "data": { ... } }`
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Client-to-server request kinds
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    GetRtpCapabilities,
    CreateRoom {
        room_id: RoomId,
    },
    JoinLecture {
        room_id: RoomId,
        user_info: UserInfo,
    },
    CreateTransport {
        room_id: RoomId,
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
    },
    Produce {
        room_id: RoomId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    ConsumeProducer {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
    },
    EndLecture {
        room_id: RoomId,
    },
    ChatMessage {
        room_id: RoomId,
        text: String,
    },
    Typing {
        room_id: RoomId,
        is_typing: bool,
    },
    Heartbeat,
}

impl ClientRequest {
    /// Request kind name for log context
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::GetRtpCapabilities => "getRtpCapabilities",
            Self::CreateRoom { .. } => "createRoom",
            Self::JoinLecture { .. } => "joinLecture",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::ConsumeProducer { .. } => "consumeProducer",
            Self::EndLecture { .. } => "endLecture",
            Self::ChatMessage { .. } => "chatMessage",
            Self::Typing { .. } => "typing",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Server-to-client broadcast events
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    NewProducer {
        producer_info: ProducerInfo,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    UpdateParticipantList {
        participants: Vec<ParticipantInfo>,
    },
    UserJoined {
        user: ParticipantInfo,
    },
    LectureEnded {
        message: String,
    },
    ChatMessage {
        from: ParticipantInfo,
        text: String,
        sent_at: DateTime<Utc>,
    },
    UserTyping {
        peer_id: PeerId,
        is_typing: bool,
    },
}

impl ServerEvent {
    /// Event kind name for log context
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NewProducer { .. } => "newProducer",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::UpdateParticipantList { .. } => "updateParticipantList",
            Self::UserJoined { .. } => "userJoined",
            Self::LectureEnded { .. } => "lectureEnded",
            Self::ChatMessage { .. } => "chatMessage",
            Self::UserTyping { .. } => "userTyping",
        }
    }
}

/// Acknowledgement body: `{ "ok": ... }` or `{ "error": { ... } }`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckBody {
    Ok(Value),
    Error(AckError),
}

/// Structured failure carried in an acknowledgement
#[derive(Debug, Clone, Serialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

impl From<&SignalError> for AckError {
    fn from(err: &SignalError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Acknowledgement envelope, correlated to a request by `id`
#[derive(Debug, Clone, Serialize)]
pub struct AckEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub body: AckBody,
}

impl AckEnvelope {
    #[must_use]
    pub const fn ok(id: u64, payload: Value) -> Self {
        Self {
            id,
            body: AckBody::Ok(payload),
        }
    }

    #[must_use]
    pub fn error(id: u64, err: &SignalError) -> Self {
        Self {
            id,
            body: AckBody::Error(AckError::from(err)),
        }
    }
}

/// Anything the server pushes down a connection. Acks and events share one
/// channel so that per-connection ordering is preserved end to end.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Ack(AckEnvelope),
    Event(ServerEvent),
}

/// Response payload for `createRoom`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
    /// True when an existing room's vacant host slot was reclaimed
    pub reclaimed: bool,
}

/// Response payload for `joinLecture`: the producer snapshot is in
/// announcement order, so a late joiner consumes in the same order earlier
/// viewers saw the announcements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinLectureResponse {
    pub producers: Vec<ProducerInfo>,
    pub participants: Vec<ParticipantInfo>,
}

/// Response payload for `createTransport`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportResponse {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    /// Opaque engine connection parameters (ICE/DTLS descriptors)
    pub parameters: Value,
}

/// Response payload for `connectTransport`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportResponse {
    /// Opaque engine handshake completion blob (null for engines whose
    /// handshake is one-shot)
    pub connection: Value,
}

/// Response payload for `produce`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

/// Response payload for `consumeProducer`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    /// Opaque engine parameters the viewer's local engine needs to finish
    /// consumer setup
    pub rtp_parameters: Value,
}

/// Response payload for `endLecture`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndLectureResponse {
    pub room_id: RoomId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_create_room_request() {
        let raw = json!({
            "id": 3,
            "type": "createRoom",
            "data": { "roomId": "r1" }
        });
        let envelope: RequestEnvelope =
            serde_json::from_value(raw).expect("createRoom should parse");
        assert_eq!(envelope.id, 3);
        match envelope.request {
            ClientRequest::CreateRoom { room_id } => {
                assert_eq!(room_id.as_str(), "r1");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_join_lecture_request() {
        let raw = json!({
            "id": 5,
            "type": "joinLecture",
            "data": { "roomId": "r1", "userInfo": { "displayName": "Prof. Ada" } }
        });
        let envelope: RequestEnvelope =
            serde_json::from_value(raw).expect("joinLecture should parse");
        match envelope.request {
            ClientRequest::JoinLecture { room_id, user_info } => {
                assert_eq!(room_id.as_str(), "r1");
                assert_eq!(user_info.display_name, "Prof. Ada");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unit_request_without_data() {
        let raw = json!({ "id": 1, "type": "getRtpCapabilities" });
        let envelope: RequestEnvelope =
            serde_json::from_value(raw).expect("unit request should parse without data");
        assert!(matches!(envelope.request, ClientRequest::GetRtpCapabilities));
    }

    #[test]
    fn test_parse_produce_request() {
        let raw = json!({
            "id": 9,
            "type": "produce",
            "data": {
                "roomId": "r1",
                "transportId": "t1",
                "kind": "video",
                "rtpParameters": { "codecs": [] }
            }
        });
        let envelope: RequestEnvelope = serde_json::from_value(raw).expect("produce should parse");
        match envelope.request {
            ClientRequest::Produce { kind, transport_id, .. } => {
                assert_eq!(kind, MediaKind::Video);
                assert_eq!(transport_id.as_str(), "t1");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_ack_ok_shape() {
        let ack = AckEnvelope::ok(7, json!({ "producerId": "p1" }));
        let value = serde_json::to_value(&ack).expect("ack should serialize");
        assert_eq!(value["id"], 7);
        assert_eq!(value["ok"]["producerId"], "p1");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_ack_error_shape() {
        let err = SignalError::RoomNotFound("r9".to_string());
        let ack = AckEnvelope::error(4, &err);
        let value = serde_json::to_value(&ack).expect("ack should serialize");
        assert_eq!(value["id"], 4);
        assert_eq!(value["error"]["code"], "roomNotFound");
        assert!(value["error"]["message"]
            .as_str()
            .expect("message is a string")
            .contains("r9"));
    }

    #[test]
    fn test_event_shape() {
        let event = ServerEvent::NewProducer {
            producer_info: ProducerInfo {
                id: ProducerId::from("p1"),
                kind: MediaKind::Video,
                peer_id: PeerId::from("host-1"),
            },
        };
        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["data"]["producerInfo"]["id"], "p1");
        assert_eq!(value["data"]["producerInfo"]["kind"], "video");
        assert_eq!(value["data"]["producerInfo"]["peerId"], "host-1");
    }

    #[test]
    fn test_outbound_serializes_flat() {
        let ack = OutboundMessage::Ack(AckEnvelope::ok(1, Value::Null));
        let value = serde_json::to_value(&ack).expect("outbound should serialize");
        assert_eq!(value["id"], 1);

        let event = OutboundMessage::Event(ServerEvent::LectureEnded {
            message: "the lecture has ended".to_string(),
        });
        let value = serde_json::to_value(&event).expect("outbound should serialize");
        assert_eq!(value["type"], "lectureEnded");
    }

    #[test]
    fn test_request_kind_names() {
        assert_eq!(ClientRequest::Heartbeat.kind(), "heartbeat");
        let req = ClientRequest::EndLecture {
            room_id: RoomId::from("r1"),
        };
        assert_eq!(req.kind(), "endLecture");
    }
}
