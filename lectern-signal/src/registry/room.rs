//! Room registry: the per-room state machine
//!
//! A room key is `Absent` or `Active(host?, producers, viewers)`. Every
//! mutation and its broadcast happen inside the same critical section, so
//! announcement order is identical for every current and future member. A
//! room whose host, producer list, and viewer list are all empty is garbage
//! and is removed in the same synchronous step that emptied it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, SignalError};
use crate::hub::{EventSender, RoomHub};
use crate::protocol::{ParticipantInfo, ProducerInfo, ServerEvent};
use crate::types::{PeerId, ProducerId, RoomId};

#[derive(Debug, Default)]
struct RoomState {
    /// Set when the room has been emptied and is on its way out of the map;
    /// mutators treat a closed room as absent
    closed: bool,
    host: Option<ParticipantInfo>,
    /// Insertion-ordered; the join snapshot and the announcements observe
    /// the same order
    producers: Vec<ProducerInfo>,
    viewers: Vec<ParticipantInfo>,
}

impl RoomState {
    fn is_empty(&self) -> bool {
        self.host.is_none() && self.producers.is_empty() && self.viewers.is_empty()
    }

    fn participants(&self) -> Vec<ParticipantInfo> {
        self.host
            .iter()
            .chain(self.viewers.iter())
            .cloned()
            .collect()
    }
}

/// A single active room
pub struct Room {
    pub id: RoomId,
    pub created_at: Instant,
    state: Mutex<RoomState>,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            state: Mutex::new(RoomState::default()),
        }
    }
}

/// Registry of active rooms, the single source of truth other components
/// query and mutate
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
    hub: Arc<RoomHub>,
    /// Maximum concurrent rooms (0 = unlimited)
    max_rooms: usize,
    /// Maximum viewers per room (0 = unlimited)
    max_viewers_per_room: usize,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(hub: Arc<RoomHub>, max_rooms: usize, max_viewers_per_room: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            hub,
            max_rooms,
            max_viewers_per_room,
        }
    }

    /// Clone the room handle without holding a map guard; callers lock the
    /// room state only after the guard is gone
    fn get_room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Remove a specific room object from the map (identity-checked, so a
    /// replacement room under the same key is left alone)
    fn remove_room_entry(&self, room_id: &RoomId, room: &Arc<Room>) {
        self.rooms
            .remove_if(room_id, |_, candidate| Arc::ptr_eq(candidate, room));
    }

    /// Check the emptiness invariant; must be called with the state lock
    /// held, and consumes it
    fn sweep_if_empty(
        &self,
        room: &Arc<Room>,
        mut state: parking_lot::MutexGuard<'_, RoomState>,
    ) {
        if state.is_empty() && !state.closed {
            state.closed = true;
            drop(state);
            self.remove_room_entry(&room.id, room);
            info!(room_id = %room.id, remaining_rooms = self.rooms.len(), "Empty room removed");
        }
    }

    /// Create a room, or reclaim the vacant host slot of an existing one.
    ///
    /// The room token is the reclaim credential: a host whose connection
    /// dropped can re-run `createRoom` with the same token and take the host
    /// slot back. A room with a present host rejects the call.
    ///
    /// Returns `true` when an existing room was reclaimed.
    pub fn create_room(
        &self,
        room_id: &RoomId,
        host: ParticipantInfo,
        sender: EventSender,
    ) -> Result<bool> {
        loop {
            if let Some(room) = self.get_room(room_id) {
                let mut state = room.state.lock();
                if state.closed {
                    // Lost a race with the emptiness sweep; clear the stale
                    // entry and create fresh
                    drop(state);
                    self.remove_room_entry(room_id, &room);
                    continue;
                }
                if state.host.is_some() {
                    return Err(SignalError::RoomAlreadyExists(room_id.to_string()));
                }

                let peer_id = host.peer_id.clone();
                state.host = Some(host);
                self.hub
                    .subscribe(room_id.clone(), peer_id.clone(), sender);
                let participants = state.participants();
                self.hub.broadcast_except(
                    room_id,
                    &peer_id,
                    ServerEvent::UpdateParticipantList { participants },
                );
                drop(state);

                info!(room_id = %room_id, peer_id = %peer_id, "Host reclaimed room");
                return Ok(true);
            }

            if self.max_rooms > 0 && self.rooms.len() >= self.max_rooms {
                return Err(SignalError::EngineError(
                    "maximum number of rooms reached".to_string(),
                ));
            }

            match self.rooms.entry(room_id.clone()) {
                Entry::Vacant(vacant) => {
                    let room = Arc::new(Room::new(room_id.clone()));
                    let peer_id = host.peer_id.clone();
                    room.state.lock().host = Some(host);
                    vacant.insert(Arc::clone(&room));
                    self.hub.subscribe(room_id.clone(), peer_id.clone(), sender);

                    info!(
                        room_id = %room_id,
                        peer_id = %peer_id,
                        total_rooms = self.rooms.len(),
                        "Room created"
                    );
                    return Ok(false);
                }
                // Raced with another creator; re-examine the occupant
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Add a viewer and return the producer snapshot plus the participant
    /// list, both captured in the same critical section that subscribes the
    /// viewer's channel; a producer announced after this call is therefore
    /// guaranteed to reach the viewer as an event, never to be missed.
    pub fn join_as_viewer(
        &self,
        room_id: &RoomId,
        viewer: ParticipantInfo,
        sender: EventSender,
    ) -> Result<(Vec<ProducerInfo>, Vec<ParticipantInfo>)> {
        let room = self
            .get_room(room_id)
            .ok_or_else(|| SignalError::RoomNotFound(room_id.to_string()))?;
        let mut state = room.state.lock();
        if state.closed {
            return Err(SignalError::RoomNotFound(room_id.to_string()));
        }
        if self.max_viewers_per_room > 0 && state.viewers.len() >= self.max_viewers_per_room {
            return Err(SignalError::EngineError(
                "maximum number of viewers reached for this room".to_string(),
            ));
        }

        let peer_id = viewer.peer_id.clone();
        state.viewers.retain(|v| v.peer_id != peer_id);
        state.viewers.push(viewer.clone());

        self.hub.subscribe(room_id.clone(), peer_id.clone(), sender);

        let producers = state.producers.clone();
        let participants = state.participants();

        self.hub
            .broadcast_except(room_id, &peer_id, ServerEvent::UserJoined { user: viewer });
        self.hub.broadcast_except(
            room_id,
            &peer_id,
            ServerEvent::UpdateParticipantList {
                participants: participants.clone(),
            },
        );
        drop(state);

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            producer_count = producers.len(),
            "Viewer joined room"
        );
        Ok((producers, participants))
    }

    /// Register a producer and announce it to everyone but the originator
    pub fn add_producer(&self, room_id: &RoomId, entry: ProducerInfo) -> Result<()> {
        let room = self
            .get_room(room_id)
            .ok_or_else(|| SignalError::RoomNotFound(room_id.to_string()))?;
        let mut state = room.state.lock();
        if state.closed {
            return Err(SignalError::RoomNotFound(room_id.to_string()));
        }
        if state.producers.iter().any(|p| p.id == entry.id) {
            return Ok(());
        }

        state.producers.push(entry.clone());
        self.hub.broadcast_except(
            room_id,
            &entry.peer_id,
            ServerEvent::NewProducer {
                producer_info: entry.clone(),
            },
        );
        drop(state);

        info!(
            room_id = %room_id,
            producer_id = %entry.id,
            kind = %entry.kind,
            "Producer registered"
        );
        Ok(())
    }

    /// Remove a producer and announce the closure. A no-op (not an error)
    /// when the producer is already gone: disconnect races are expected, and
    /// the no-op guarantees the closure is broadcast at most once.
    pub fn remove_producer(&self, room_id: &RoomId, producer_id: &ProducerId) -> bool {
        let Some(room) = self.get_room(room_id) else {
            return false;
        };
        let mut state = room.state.lock();
        if state.closed {
            return false;
        }
        let before = state.producers.len();
        state.producers.retain(|p| &p.id != producer_id);
        if state.producers.len() == before {
            return false;
        }

        self.hub.broadcast(
            room_id,
            ServerEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            },
        );
        debug!(room_id = %room_id, producer_id = %producer_id, "Producer removed");

        self.sweep_if_empty(&room, state);
        true
    }

    /// Remove a viewer, unsubscribe its channel, and broadcast the updated
    /// participant list; no-op for unknown viewers
    pub fn remove_viewer(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        let Some(room) = self.get_room(room_id) else {
            return false;
        };
        let mut state = room.state.lock();
        if state.closed {
            return false;
        }
        let before = state.viewers.len();
        state.viewers.retain(|v| &v.peer_id != peer_id);
        if state.viewers.len() == before {
            return false;
        }

        self.hub.unsubscribe(peer_id);
        let participants = state.participants();
        self.hub
            .broadcast(room_id, ServerEvent::UpdateParticipantList { participants });
        debug!(room_id = %room_id, peer_id = %peer_id, "Viewer removed");

        self.sweep_if_empty(&room, state);
        true
    }

    /// Clear the host slot. Producers are left alone (a host may reconnect
    /// and reclaim the room) but an otherwise empty room is removed.
    pub fn set_host_absent(&self, room_id: &RoomId) -> Option<PeerId> {
        let room = self.get_room(room_id)?;
        let mut state = room.state.lock();
        if state.closed {
            return None;
        }
        let host = state.host.take()?;

        self.hub.unsubscribe(&host.peer_id);
        let participants = state.participants();
        self.hub
            .broadcast(room_id, ServerEvent::UpdateParticipantList { participants });
        debug!(room_id = %room_id, peer_id = %host.peer_id, "Host cleared");

        self.sweep_if_empty(&room, state);
        Some(host.peer_id)
    }

    /// Whether a room key is active
    #[must_use]
    pub fn is_active(&self, room_id: &RoomId) -> bool {
        self.get_room(room_id)
            .is_some_and(|room| !room.state.lock().closed)
    }

    /// Current host of a room, if any
    #[must_use]
    pub fn host_of(&self, room_id: &RoomId) -> Option<PeerId> {
        let room = self.get_room(room_id)?;
        let state = room.state.lock();
        if state.closed {
            return None;
        }
        state.host.as_ref().map(|h| h.peer_id.clone())
    }

    /// Look up a producer inside a room
    #[must_use]
    pub fn find_producer(&self, room_id: &RoomId, producer_id: &ProducerId) -> Option<ProducerInfo> {
        let room = self.get_room(room_id)?;
        let state = room.state.lock();
        if state.closed {
            return None;
        }
        state.producers.iter().find(|p| &p.id == producer_id).cloned()
    }

    /// Find which room a producer lives in (engine-event cascades arrive
    /// with only the producer id)
    #[must_use]
    pub fn find_producer_room(&self, producer_id: &ProducerId) -> Option<RoomId> {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for room in rooms {
            let state = room.state.lock();
            if !state.closed && state.producers.iter().any(|p| &p.id == producer_id) {
                return Some(room.id.clone());
            }
        }
        None
    }

    /// Snapshot of a room's participant list
    #[must_use]
    pub fn participants(&self, room_id: &RoomId) -> Vec<ParticipantInfo> {
        self.get_room(room_id)
            .map(|room| room.state.lock().participants())
            .unwrap_or_default()
    }

    /// Number of active rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OutboundMessage, ParticipantRole};
    use crate::types::MediaKind;
    use tokio::sync::mpsc;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(RoomHub::new()), 0, 0)
    }

    fn participant(id: &str, role: ParticipantRole) -> ParticipantInfo {
        ParticipantInfo {
            peer_id: PeerId::from(id),
            display_name: id.to_string(),
            role,
        }
    }

    fn producer(id: &str, peer: &str, kind: MediaKind) -> ProducerInfo {
        ProducerInfo {
            id: ProducerId::from(id),
            kind,
            peer_id: PeerId::from(peer),
        }
    }

    fn channel() -> (
        EventSender,
        mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> ServerEvent {
        match rx.try_recv().expect("event expected") {
            OutboundMessage::Event(event) => event,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_room_twice_fails() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let reclaimed = registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx1)
            .expect("first create succeeds");
        assert!(!reclaimed);

        let err = registry
            .create_room(&room_id, participant("host2", ParticipantRole::Host), tx2)
            .expect_err("second create fails");
        assert_eq!(err, SignalError::RoomAlreadyExists("r1".to_string()));
    }

    #[tokio::test]
    async fn test_host_reclaims_vacant_room() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");

        // Viewer keeps the room alive while the host drops
        let (vtx, _vrx) = channel();
        registry
            .join_as_viewer(&room_id, participant("v1", ParticipantRole::Viewer), vtx)
            .expect("join");
        registry.set_host_absent(&room_id);
        assert!(registry.is_active(&room_id));
        assert!(registry.host_of(&room_id).is_none());

        let (tx2, _rx2) = channel();
        let reclaimed = registry
            .create_room(&room_id, participant("host-b", ParticipantRole::Host), tx2)
            .expect("reclaim succeeds");
        assert!(reclaimed);
        assert_eq!(
            registry.host_of(&room_id),
            Some(PeerId::from("host-b"))
        );
        assert_eq!(registry.participants(&room_id).len(), 2);
    }

    #[tokio::test]
    async fn test_join_missing_room_fails() {
        let registry = registry();
        let (tx, _rx) = channel();
        let err = registry
            .join_as_viewer(
                &RoomId::from("ghost"),
                participant("v1", ParticipantRole::Viewer),
                tx,
            )
            .expect_err("join should fail");
        assert!(matches!(err, SignalError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_join_before_producers_returns_empty_snapshot() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");

        let (vtx, _vrx) = channel();
        let (producers, participants) = registry
            .join_as_viewer(&room_id, participant("v1", ParticipantRole::Viewer), vtx)
            .expect("join succeeds with no producers");
        assert!(producers.is_empty());
        assert_eq!(participants.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_preserves_announcement_order() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");

        registry
            .add_producer(&room_id, producer("pa", "host", MediaKind::Audio))
            .expect("add pa");
        registry
            .add_producer(&room_id, producer("pb", "host", MediaKind::Video))
            .expect("add pb");

        let (vtx, _vrx) = channel();
        let (producers, _) = registry
            .join_as_viewer(&room_id, participant("v1", ParticipantRole::Viewer), vtx)
            .expect("join");
        let ids: Vec<&str> = producers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["pa", "pb"]);
    }

    #[tokio::test]
    async fn test_viewer_receives_new_producer_once() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");

        let (vtx, mut vrx) = channel();
        registry
            .join_as_viewer(&room_id, participant("v1", ParticipantRole::Viewer), vtx)
            .expect("join");

        registry
            .add_producer(&room_id, producer("p1", "host", MediaKind::Video))
            .expect("add");

        match next_event(&mut vrx) {
            ServerEvent::NewProducer { producer_info } => {
                assert_eq!(producer_info.id.as_str(), "p1");
                assert_eq!(producer_info.kind, MediaKind::Video);
                assert_eq!(producer_info.peer_id.as_str(), "host");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(vrx.try_recv().is_err(), "no duplicate announcement");
    }

    #[tokio::test]
    async fn test_producer_announcement_not_echoed_to_host() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, mut hrx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");

        registry
            .add_producer(&room_id, producer("p1", "host", MediaKind::Video))
            .expect("add");
        assert!(hrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_producer_is_idempotent() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");
        registry
            .add_producer(&room_id, producer("p1", "host", MediaKind::Video))
            .expect("add");

        let (vtx, mut vrx) = channel();
        registry
            .join_as_viewer(&room_id, participant("v1", ParticipantRole::Viewer), vtx)
            .expect("join");

        assert!(registry.remove_producer(&room_id, &ProducerId::from("p1")));
        assert!(!registry.remove_producer(&room_id, &ProducerId::from("p1")));

        let mut closed_count = 0;
        while let Ok(message) = vrx.try_recv() {
            if let OutboundMessage::Event(ServerEvent::ProducerClosed { .. }) = message {
                closed_count += 1;
            }
        }
        assert_eq!(closed_count, 1, "closure broadcast exactly once");
    }

    #[tokio::test]
    async fn test_room_removed_when_emptied() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");
        registry
            .add_producer(&room_id, producer("p1", "host", MediaKind::Video))
            .expect("add");

        registry.remove_producer(&room_id, &ProducerId::from("p1"));
        assert!(registry.is_active(&room_id), "host still present");

        registry.set_host_absent(&room_id);
        assert!(!registry.is_active(&room_id), "empty room removed");
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_room_survives_host_loss_while_viewers_remain() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");
        let (vtx, _vrx) = channel();
        registry
            .join_as_viewer(&room_id, participant("v1", ParticipantRole::Viewer), vtx)
            .expect("join");

        registry.set_host_absent(&room_id);
        assert!(registry.is_active(&room_id));

        registry.remove_viewer(&room_id, &PeerId::from("v1"));
        assert!(!registry.is_active(&room_id));
    }

    #[tokio::test]
    async fn test_find_producer_room() {
        let registry = registry();
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");
        registry
            .add_producer(&room_id, producer("p1", "host", MediaKind::Audio))
            .expect("add");

        assert_eq!(
            registry.find_producer_room(&ProducerId::from("p1")),
            Some(room_id.clone())
        );
        assert!(registry
            .find_producer_room(&ProducerId::from("ghost"))
            .is_none());
    }

    #[tokio::test]
    async fn test_viewer_limit() {
        let registry = RoomRegistry::new(Arc::new(RoomHub::new()), 0, 1);
        let room_id = RoomId::from("r1");
        let (tx, _rx) = channel();
        registry
            .create_room(&room_id, participant("host", ParticipantRole::Host), tx)
            .expect("create");

        let (v1tx, _v1rx) = channel();
        registry
            .join_as_viewer(&room_id, participant("v1", ParticipantRole::Viewer), v1tx)
            .expect("first viewer fits");

        let (v2tx, _v2rx) = channel();
        let err = registry
            .join_as_viewer(&room_id, participant("v2", ParticipantRole::Viewer), v2tx)
            .expect_err("second viewer rejected");
        assert!(matches!(err, SignalError::EngineError(_)));
    }
}
