//! WebSocket signaling endpoint
//!
//! One connection per peer. Inbound frames are JSON request envelopes;
//! every one of them is answered with exactly one acknowledgement, even when
//! the handler fails internally. Acknowledgements and room broadcasts share
//! a single ordered outbound channel pumped by a writer task, so a peer
//! observes events in the order the registries emitted them.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lectern_signal::error::SignalError;
use lectern_signal::hub::EventSender;
use lectern_signal::protocol::{AckEnvelope, OutboundMessage, RequestEnvelope};
use lectern_signal::types::PeerId;

use crate::http::AppState;

/// Cap for inbound signaling frames; 64KB is plenty for SDP blobs and spares
/// the server from oversized payloads
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Query parameters for the WebSocket connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Display name shown to other participants
    pub peer_name: Option<String>,
}

/// WebSocket handler for lecture signaling
///
/// Clients connect to `ws://host/ws/lecture?peerName={name}`.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let peer_name = query.peer_name.unwrap_or_else(|| "anonymous".to_string());

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, peer_name))
}

async fn handle_socket(socket: WebSocket, state: AppState, peer_name: String) {
    let cancel = CancellationToken::new();
    let peer_id = match state.coordinator.connect(&peer_name, cancel.clone()) {
        Ok(peer_id) => peer_id,
        Err(e) => {
            warn!(error = %e, "Connection rejected");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(peer_id = %peer_id, peer_name = %peer_name, "Signaling connection established");

    // Single ordered outbound channel: acks and broadcasts interleave in
    // commit order
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: outbound channel -> socket
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                        debug!(peer_id = %writer_peer, error = %e, "Socket write failed");
                        break;
                    }
                }
                Err(e) => {
                    error!(peer_id = %writer_peer, error = %e, "Outbound serialization failed");
                }
            }
        }
    });

    // Request loop: socket -> coordinator
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(peer_id = %peer_id, "Connection evicted by coordinator");
                break;
            }
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &peer_id, text.as_str(), &outbound_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer_id = %peer_id, error = %e, "Socket read failed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames are not signaling
                    }
                }
            }
        }
    }

    // Disconnect cleanup: tolerates a peer that never joined anything, and a
    // watchdog eviction that already ran it
    state.coordinator.disconnect(&peer_id).await;

    drop(outbound_tx);
    let _ = writer.await;

    info!(peer_id = %peer_id, "Signaling connection closed");
}

/// Parse and dispatch one frame, always producing exactly one ack for any
/// frame that carries a request id
async fn handle_frame(state: &AppState, peer_id: &PeerId, text: &str, outbound: &EventSender) {
    // Recover the correlation id first so even a malformed request gets its
    // ack instead of leaving the caller hanging
    let Some(request_id) = extract_request_id(text) else {
        warn!(peer_id = %peer_id, "Frame without request id ignored");
        return;
    };

    let ack = match serde_json::from_str::<RequestEnvelope>(text) {
        Ok(envelope) => {
            let kind = envelope.request.kind();
            match state
                .coordinator
                .handle_request(peer_id, envelope.request, outbound)
                .await
            {
                Ok(payload) => AckEnvelope::ok(request_id, payload),
                Err(err) => {
                    debug!(
                        peer_id = %peer_id,
                        request = kind,
                        code = err.code(),
                        error = %err,
                        "Request failed"
                    );
                    AckEnvelope::error(request_id, &err)
                }
            }
        }
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e, "Malformed request");
            AckEnvelope::error(
                request_id,
                &SignalError::EngineError(format!("malformed request: {e}")),
            )
        }
    };

    let _ = outbound.send(OutboundMessage::Ack(ack));
}

fn extract_request_id(text: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_request_id() {
        assert_eq!(
            extract_request_id(r#"{"id": 7, "type": "heartbeat"}"#),
            Some(7)
        );
        assert_eq!(extract_request_id(r#"{"type": "heartbeat"}"#), None);
        assert_eq!(extract_request_id("not json"), None);
    }
}
