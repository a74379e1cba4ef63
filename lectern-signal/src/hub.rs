//! In-memory hub for routing server events to connected peers in rooms
//!
//! Each subscriber hands the hub a clone of its connection's ordered outbound
//! sender; events broadcast for one room reach every member in send order.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{OutboundMessage, ServerEvent};
use crate::types::{PeerId, RoomId};

/// Message sender for a peer connection
pub type EventSender = mpsc::UnboundedSender<OutboundMessage>;

/// Subscriber information
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub peer_id: PeerId,
    pub sender: EventSender,
}

/// Event fan-out hub, one subscriber list per room
#[derive(Clone, Default)]
pub struct RoomHub {
    /// Map of room_id -> list of subscribers
    rooms: Arc<DashMap<RoomId, Vec<Subscriber>>>,

    /// Map of peer_id -> room_id for cleanup
    peers: Arc<DashMap<PeerId, RoomId>>,
}

impl RoomHub {
    /// Create a new `RoomHub`
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe a peer's outbound channel to room events
    pub fn subscribe(&self, room_id: RoomId, peer_id: PeerId, sender: EventSender) {
        let subscriber = Subscriber {
            peer_id: peer_id.clone(),
            sender,
        };

        self.rooms
            .entry(room_id.clone())
            .or_default()
            .push(subscriber);

        self.peers.insert(peer_id.clone(), room_id.clone());

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            "Peer subscribed to room"
        );
    }

    /// Unsubscribe a peer from room events; no-op for unknown peers
    pub fn unsubscribe(&self, peer_id: &PeerId) {
        if let Some((_, room_id)) = self.peers.remove(peer_id) {
            if let Some(mut subscribers) = self.rooms.get_mut(&room_id) {
                subscribers.retain(|sub| &sub.peer_id != peer_id);

                if subscribers.is_empty() {
                    drop(subscribers); // Drop the RefMut before removing
                    self.rooms.remove(&room_id);
                    debug!(room_id = %room_id, "Room has no more subscribers, removed");
                }
            }

            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                "Peer unsubscribed from room"
            );
        }
    }

    /// Broadcast an event to all subscribers in a room
    pub fn broadcast(&self, room_id: &RoomId, event: ServerEvent) -> usize {
        self.broadcast_inner(room_id, None, event)
    }

    /// Broadcast an event to all subscribers in a room except the originator
    pub fn broadcast_except(&self, room_id: &RoomId, except: &PeerId, event: ServerEvent) -> usize {
        self.broadcast_inner(room_id, Some(except), event)
    }

    fn broadcast_inner(
        &self,
        room_id: &RoomId,
        except: Option<&PeerId>,
        event: ServerEvent,
    ) -> usize {
        let mut sent_count = 0;
        let mut failed_peers = Vec::new();

        if let Some(subscribers) = self.rooms.get(room_id) {
            for subscriber in subscribers.iter() {
                if except == Some(&subscriber.peer_id) {
                    continue;
                }
                match subscriber
                    .sender
                    .send(OutboundMessage::Event(event.clone()))
                {
                    Ok(()) => sent_count += 1,
                    Err(err) => {
                        warn!(
                            room_id = %room_id,
                            peer_id = %subscriber.peer_id,
                            error = %err,
                            "Failed to send event to peer, marking for cleanup"
                        );
                        failed_peers.push(subscriber.peer_id.clone());
                    }
                }
            }
        }

        // Clean up subscribers whose connections are gone
        for peer_id in failed_peers {
            self.unsubscribe(&peer_id);
        }

        if sent_count > 0 {
            debug!(
                room_id = %room_id,
                sent_count = sent_count,
                event_type = %event.kind(),
                "Event broadcast complete"
            );
        }

        sent_count
    }

    /// Get the number of subscribers in a room
    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Get the number of rooms with at least one subscriber
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParticipantInfo, ParticipantRole};

    fn subscriber() -> (PeerId, EventSender, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerId::new(), tx, rx)
    }

    fn sample_event() -> ServerEvent {
        ServerEvent::UserJoined {
            user: ParticipantInfo {
                peer_id: PeerId::from("p1"),
                display_name: "viewer".to_string(),
                role: ParticipantRole::Viewer,
            },
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_broadcast() {
        let hub = RoomHub::new();
        let room_id = RoomId::from("test_room");
        let (peer_id, tx, mut rx) = subscriber();

        hub.subscribe(room_id.clone(), peer_id, tx);
        assert_eq!(hub.subscriber_count(&room_id), 1);

        let sent = hub.broadcast(&room_id, sample_event());
        assert_eq!(sent, 1);

        let received = rx.recv().await.expect("event should arrive");
        match received {
            OutboundMessage::Event(event) => assert_eq!(event.kind(), "userJoined"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_origin() {
        let hub = RoomHub::new();
        let room_id = RoomId::from("test_room");
        let (origin, origin_tx, mut origin_rx) = subscriber();
        let (_other, other_tx, mut other_rx) = subscriber();

        hub.subscribe(room_id.clone(), origin.clone(), origin_tx);
        hub.subscribe(room_id.clone(), PeerId::from("other"), other_tx);

        let sent = hub.broadcast_except(&room_id, &origin, sample_event());
        assert_eq!(sent, 1);

        assert!(other_rx.recv().await.is_some());
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_empty_room() {
        let hub = RoomHub::new();
        let room_id = RoomId::from("test_room");
        let (peer_id, tx, _rx) = subscriber();

        hub.subscribe(room_id.clone(), peer_id.clone(), tx);
        assert_eq!(hub.room_count(), 1);

        hub.unsubscribe(&peer_id);
        assert_eq!(hub.subscriber_count(&room_id), 0);
        assert_eq!(hub.room_count(), 0);

        // Second unsubscribe is a no-op
        hub.unsubscribe(&peer_id);
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_cleaned_up() {
        let hub = RoomHub::new();
        let room_id = RoomId::from("test_room");
        let (peer_id, tx, rx) = subscriber();

        hub.subscribe(room_id.clone(), peer_id, tx);
        drop(rx); // Connection gone

        let sent = hub.broadcast(&room_id, sample_event());
        assert_eq!(sent, 0);
        assert_eq!(hub.subscriber_count(&room_id), 0);
    }

    #[tokio::test]
    async fn test_events_arrive_in_send_order() {
        let hub = RoomHub::new();
        let room_id = RoomId::from("test_room");
        let (peer_id, tx, mut rx) = subscriber();
        hub.subscribe(room_id.clone(), peer_id, tx);

        for n in 0..4u64 {
            hub.broadcast(
                &room_id,
                ServerEvent::ChatMessage {
                    from: ParticipantInfo {
                        peer_id: PeerId::from("p1"),
                        display_name: "host".to_string(),
                        role: ParticipantRole::Host,
                    },
                    text: n.to_string(),
                    sent_at: chrono::Utc::now(),
                },
            );
        }

        for n in 0..4u64 {
            match rx.recv().await.expect("event should arrive") {
                OutboundMessage::Event(ServerEvent::ChatMessage { text, .. }) => {
                    assert_eq!(text, n.to_string());
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }
}
