//! Peer index: per-connection state and owned-resource indexes
//!
//! A peer's transport/producer/consumer id sets are indexes into the other
//! registries, not ownership: they exist so that disconnect cleanup can
//! find everything a connection left behind. Peer state lives exactly as
//! long as the connection: created on connect, removed on disconnect, never
//! persisted.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, SignalError};
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};

/// Explicit, validated role, set at `createRoom`/`joinLecture` time and
/// checked on every privileged operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRole {
    Host { room: RoomId },
    Viewer { room: RoomId },
}

impl PeerRole {
    #[must_use]
    pub const fn room(&self) -> &RoomId {
        match self {
            Self::Host { room } | Self::Viewer { room } => room,
        }
    }

    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Host { .. })
    }
}

/// Per-connection state
#[derive(Debug)]
pub struct PeerState {
    pub peer_id: PeerId,
    pub display_name: String,
    pub role: Option<PeerRole>,
    pub transports: HashSet<TransportId>,
    pub producers: HashSet<ProducerId>,
    /// Consumer -> bound producer, so a producer closure can cascade to the
    /// consumers it feeds
    pub consumers: HashMap<ConsumerId, ProducerId>,
    pub connected_at: Instant,
    pub last_seen: Instant,
    /// Cancelled to tear the connection's request loop down from outside
    /// (heartbeat eviction)
    pub cancel: CancellationToken,
}

impl PeerState {
    fn new(peer_id: PeerId, display_name: String, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            display_name,
            role: None,
            transports: HashSet::new(),
            producers: HashSet::new(),
            consumers: HashMap::new(),
            connected_at: now,
            last_seen: now,
            cancel,
        }
    }
}

/// Index of connected peers
pub struct PeerIndex {
    peers: DashMap<PeerId, PeerState>,
    /// Maximum concurrent connections (0 = unlimited)
    max_peers: usize,
}

impl PeerIndex {
    #[must_use]
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: DashMap::new(),
            max_peers,
        }
    }

    /// Register a new connection
    pub fn register(&self, display_name: String, cancel: CancellationToken) -> Result<PeerId> {
        if self.max_peers > 0 && self.peers.len() >= self.max_peers {
            warn!(
                current_peers = self.peers.len(),
                max_peers = self.max_peers,
                "Connection rejected, server at capacity"
            );
            return Err(SignalError::EngineError("server at capacity".to_string()));
        }

        let peer_id = PeerId::new();
        self.peers.insert(
            peer_id.clone(),
            PeerState::new(peer_id.clone(), display_name, cancel),
        );

        info!(
            peer_id = %peer_id,
            total_peers = self.peers.len(),
            "Peer registered"
        );
        Ok(peer_id)
    }

    /// Remove a connection, returning its final state for cleanup; `None` if
    /// already gone
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerState> {
        let (_, state) = self.peers.remove(peer_id)?;
        info!(
            peer_id = %peer_id,
            connected_for = ?state.connected_at.elapsed(),
            remaining_peers = self.peers.len(),
            "Peer removed"
        );
        Some(state)
    }

    /// Record request activity for heartbeat tracking
    pub fn touch(&self, peer_id: &PeerId) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.last_seen = Instant::now();
        }
    }

    /// Assign the peer's role; rejects switching rooms or roles on a live
    /// connection
    pub fn set_role(&self, peer_id: &PeerId, role: PeerRole) -> Result<()> {
        let mut state = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::Unauthorized("unknown peer".to_string()))?;
        if state.role.is_some() {
            return Err(SignalError::Unauthorized(
                "peer already joined a room".to_string(),
            ));
        }
        state.role = Some(role);
        Ok(())
    }

    /// Clear the peer's role (host ended the lecture but kept the connection)
    pub fn clear_role(&self, peer_id: &PeerId) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.role = None;
        }
    }

    #[must_use]
    pub fn role_of(&self, peer_id: &PeerId) -> Option<PeerRole> {
        self.peers.get(peer_id).and_then(|state| state.role.clone())
    }

    #[must_use]
    pub fn display_name(&self, peer_id: &PeerId) -> Option<String> {
        self.peers.get(peer_id).map(|state| state.display_name.clone())
    }

    /// Replace the display name (joins carry user-supplied info)
    pub fn set_display_name(&self, peer_id: &PeerId, display_name: String) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.display_name = display_name;
        }
    }

    /// Drain every resource index the peer holds, leaving the peer
    /// registered. Cleanup works off the drained lists, so a racing cleanup
    /// pass finds the indexes already empty and does nothing.
    #[must_use]
    pub fn drain_resources(
        &self,
        peer_id: &PeerId,
    ) -> Option<(Vec<ProducerId>, Vec<ConsumerId>, Vec<TransportId>)> {
        let mut state = self.peers.get_mut(peer_id)?;
        let producers = state.producers.drain().collect();
        let consumers = state.consumers.drain().map(|(id, _)| id).collect();
        let transports = state.transports.drain().collect();
        Some((producers, consumers, transports))
    }

    pub fn add_transport(&self, peer_id: &PeerId, transport_id: TransportId) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.transports.insert(transport_id);
        }
    }

    /// Returns whether the transport was still indexed (exactly-once guard)
    pub fn remove_transport(&self, peer_id: &PeerId, transport_id: &TransportId) -> bool {
        self.peers
            .get_mut(peer_id)
            .is_some_and(|mut state| state.transports.remove(transport_id))
    }

    pub fn add_producer(&self, peer_id: &PeerId, producer_id: ProducerId) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.producers.insert(producer_id);
        }
    }

    /// Returns whether the producer was still indexed (exactly-once guard:
    /// engine callbacks and disconnect cleanup race to close the same
    /// producer, and only the first remover proceeds with the cascade)
    pub fn remove_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> bool {
        self.peers
            .get_mut(peer_id)
            .is_some_and(|mut state| state.producers.remove(producer_id))
    }

    pub fn add_consumer(&self, peer_id: &PeerId, consumer_id: ConsumerId, producer_id: ProducerId) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.consumers.insert(consumer_id, producer_id);
        }
    }

    /// Returns whether the consumer was still indexed
    pub fn remove_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> bool {
        self.peers
            .get_mut(peer_id)
            .is_some_and(|mut state| state.consumers.remove(consumer_id).is_some())
    }

    /// All consumers, across every peer, bound to the given producer
    #[must_use]
    pub fn consumers_of_producer(&self, producer_id: &ProducerId) -> Vec<(PeerId, ConsumerId)> {
        let mut bound = Vec::new();
        for entry in self.peers.iter() {
            for (consumer_id, bound_producer) in &entry.value().consumers {
                if bound_producer == producer_id {
                    bound.push((entry.key().clone(), consumer_id.clone()));
                }
            }
        }
        bound
    }

    /// The peer owning a producer, for engine-event cascades
    #[must_use]
    pub fn owner_of_producer(&self, producer_id: &ProducerId) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|entry| entry.value().producers.contains(producer_id))
            .map(|entry| entry.key().clone())
    }

    /// The peer owning a transport, for engine-event cascades
    #[must_use]
    pub fn owner_of_transport(&self, transport_id: &TransportId) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|entry| entry.value().transports.contains(transport_id))
            .map(|entry| entry.key().clone())
    }

    /// Peers whose last activity is older than the timeout
    #[must_use]
    pub fn stale_peers(&self, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|entry| entry.value().last_seen.elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> PeerIndex {
        PeerIndex::new(0)
    }

    #[test]
    fn test_register_and_remove() {
        let index = index();
        let peer = index
            .register("viewer".to_string(), CancellationToken::new())
            .expect("register");
        assert_eq!(index.peer_count(), 1);

        let state = index.remove(&peer).expect("state returned");
        assert_eq!(state.display_name, "viewer");
        assert_eq!(index.peer_count(), 0);
        assert!(index.remove(&peer).is_none(), "second remove is a no-op");
    }

    #[test]
    fn test_capacity_limit() {
        let index = PeerIndex::new(1);
        index
            .register("first".to_string(), CancellationToken::new())
            .expect("fits");
        let err = index
            .register("second".to_string(), CancellationToken::new())
            .expect_err("over capacity");
        assert!(matches!(err, SignalError::EngineError(_)));
    }

    #[test]
    fn test_role_cannot_be_switched() {
        let index = index();
        let peer = index
            .register("host".to_string(), CancellationToken::new())
            .expect("register");

        index
            .set_role(
                &peer,
                PeerRole::Host {
                    room: RoomId::from("r1"),
                },
            )
            .expect("first role");

        let err = index
            .set_role(
                &peer,
                PeerRole::Viewer {
                    room: RoomId::from("r2"),
                },
            )
            .expect_err("switching rejected");
        assert!(matches!(err, SignalError::Unauthorized(_)));

        index.clear_role(&peer);
        index
            .set_role(
                &peer,
                PeerRole::Viewer {
                    room: RoomId::from("r2"),
                },
            )
            .expect("role assignable after clear");
    }

    #[test]
    fn test_producer_removal_is_exactly_once() {
        let index = index();
        let peer = index
            .register("host".to_string(), CancellationToken::new())
            .expect("register");
        let producer = ProducerId::from("p1");

        index.add_producer(&peer, producer.clone());
        assert!(index.remove_producer(&peer, &producer));
        assert!(!index.remove_producer(&peer, &producer));
    }

    #[test]
    fn test_consumers_of_producer() {
        let index = index();
        let v1 = index
            .register("v1".to_string(), CancellationToken::new())
            .expect("register");
        let v2 = index
            .register("v2".to_string(), CancellationToken::new())
            .expect("register");
        let producer = ProducerId::from("p1");

        index.add_consumer(&v1, ConsumerId::from("c1"), producer.clone());
        index.add_consumer(&v2, ConsumerId::from("c2"), producer.clone());
        index.add_consumer(&v2, ConsumerId::from("c3"), ProducerId::from("other"));

        let mut bound = index.consumers_of_producer(&producer);
        bound.sort_by(|a, b| a.1.as_str().cmp(b.1.as_str()));
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].1.as_str(), "c1");
        assert_eq!(bound[1].1.as_str(), "c2");
    }

    #[test]
    fn test_stale_peers() {
        let index = index();
        let peer = index
            .register("idle".to_string(), CancellationToken::new())
            .expect("register");

        assert!(index.stale_peers(Duration::from_secs(60)).is_empty());
        // Zero timeout: everything not touched within this instant is stale
        std::thread::sleep(Duration::from_millis(5));
        let stale = index.stale_peers(Duration::from_millis(1));
        assert_eq!(stale, vec![peer.clone()]);

        index.touch(&peer);
        assert!(index.stale_peers(Duration::from_secs(60)).is_empty());
    }
}
