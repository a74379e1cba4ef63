//! Transport registry: engine transport identity, ownership, and teardown
//!
//! At most one send and one receive transport per peer. A second request for
//! an occupied slot is rejected rather than silently replacing the first;
//! silent replacement hides client bugs and leaks the prior engine resource.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::MediaEngine;
use crate::error::{Result, SignalError};
use crate::types::{PeerId, TransportDirection, TransportId};

/// Ownership record for one engine transport
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: TransportId,
    pub peer_id: PeerId,
    pub direction: TransportDirection,
}

/// Registry of live engine transports
pub struct TransportRegistry {
    engine: Arc<dyn MediaEngine>,
    transports: DashMap<TransportId, TransportRecord>,
    /// Per-peer direction slots
    slots: DashMap<(PeerId, TransportDirection), TransportId>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            transports: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Whether the peer already holds a transport for this direction
    #[must_use]
    pub fn has_slot(&self, peer_id: &PeerId, direction: TransportDirection) -> bool {
        self.slots.contains_key(&(peer_id.clone(), direction))
    }

    /// Record ownership of a freshly allocated engine transport.
    ///
    /// Fails with `TransportAlreadyExists` when the peer already has a live
    /// transport in this direction; the caller must release the fresh engine
    /// resource.
    pub fn register(
        &self,
        peer_id: PeerId,
        direction: TransportDirection,
        transport_id: TransportId,
    ) -> Result<()> {
        match self.slots.entry((peer_id.clone(), direction)) {
            Entry::Occupied(_) => Err(SignalError::TransportAlreadyExists(format!(
                "{direction} transport for peer {peer_id}"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(transport_id.clone());
                self.transports.insert(
                    transport_id.clone(),
                    TransportRecord {
                        id: transport_id.clone(),
                        peer_id: peer_id.clone(),
                        direction,
                    },
                );
                info!(
                    transport_id = %transport_id,
                    peer_id = %peer_id,
                    direction = %direction,
                    "Transport registered"
                );
                Ok(())
            }
        }
    }

    /// Look up a transport the peer owns. Unknown ids and transports owned
    /// by another peer both come back as `TransportNotFound`: the caller
    /// learns nothing about other peers' resources.
    pub fn get_owned(&self, transport_id: &TransportId, peer_id: &PeerId) -> Result<TransportRecord> {
        self.transports
            .get(transport_id)
            .filter(|record| &record.peer_id == peer_id)
            .map(|record| record.clone())
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))
    }

    /// Release a transport and its engine resource; idempotent
    pub async fn close(&self, transport_id: &TransportId) {
        if let Some((_, record)) = self.transports.remove(transport_id) {
            self.slots
                .remove_if(&(record.peer_id.clone(), record.direction), |_, id| {
                    id == transport_id
                });
            self.engine.close_transport(transport_id).await;
            debug!(
                transport_id = %transport_id,
                peer_id = %record.peer_id,
                "Transport released"
            );
        }
    }

    /// Release every transport a peer owns; returns how many were closed
    pub async fn close_all_for_peer(&self, peer_id: &PeerId) -> usize {
        let owned: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|entry| &entry.value().peer_id == peer_id)
            .map(|entry| entry.key().clone())
            .collect();

        let count = owned.len();
        for transport_id in owned {
            self.close(&transport_id).await;
        }
        count
    }

    /// Ownership record for a transport, regardless of caller
    #[must_use]
    pub fn get(&self, transport_id: &TransportId) -> Option<TransportRecord> {
        self.transports.get(transport_id).map(|record| record.clone())
    }

    /// Number of live transports
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    fn registry() -> (Arc<MockEngine>, TransportRegistry) {
        let engine = Arc::new(MockEngine::new());
        let registry = TransportRegistry::new(Arc::clone(&engine) as Arc<dyn MediaEngine>);
        (engine, registry)
    }

    #[tokio::test]
    async fn test_register_and_get_owned() {
        let (_, registry) = registry();
        let peer = PeerId::from("peer1");
        let transport_id = TransportId::from("t1");

        registry
            .register(peer.clone(), TransportDirection::Send, transport_id.clone())
            .expect("register");

        let record = registry
            .get_owned(&transport_id, &peer)
            .expect("owner can look up");
        assert_eq!(record.direction, TransportDirection::Send);

        let err = registry
            .get_owned(&transport_id, &PeerId::from("intruder"))
            .expect_err("other peers see nothing");
        assert!(matches!(err, SignalError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_second_transport_same_direction_rejected() {
        let (_, registry) = registry();
        let peer = PeerId::from("peer1");

        registry
            .register(peer.clone(), TransportDirection::Send, TransportId::from("t1"))
            .expect("first register");

        let err = registry
            .register(peer.clone(), TransportDirection::Send, TransportId::from("t2"))
            .expect_err("slot occupied");
        assert!(matches!(err, SignalError::TransportAlreadyExists(_)));

        // The other direction is a separate slot
        registry
            .register(peer, TransportDirection::Recv, TransportId::from("t3"))
            .expect("recv slot free");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_frees_slot() {
        let (engine, registry) = registry();
        let peer = PeerId::from("peer1");
        let handle = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect("engine transport");

        registry
            .register(peer.clone(), TransportDirection::Send, handle.id.clone())
            .expect("register");

        registry.close(&handle.id).await;
        registry.close(&handle.id).await;
        assert_eq!(engine.closed_transport_count(), 1);

        // Slot is free again
        registry
            .register(peer, TransportDirection::Send, TransportId::from("t2"))
            .expect("slot free after close");
    }

    #[tokio::test]
    async fn test_close_all_for_peer() {
        let (engine, registry) = registry();
        let peer = PeerId::from("peer1");
        let other = PeerId::from("peer2");

        let send = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect("send transport");
        let recv = engine
            .create_transport(TransportDirection::Recv)
            .await
            .expect("recv transport");
        let theirs = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect("their transport");

        registry
            .register(peer.clone(), TransportDirection::Send, send.id.clone())
            .expect("register send");
        registry
            .register(peer.clone(), TransportDirection::Recv, recv.id.clone())
            .expect("register recv");
        registry
            .register(other.clone(), TransportDirection::Send, theirs.id.clone())
            .expect("register theirs");

        let closed = registry.close_all_for_peer(&peer).await;
        assert_eq!(closed, 2);
        assert_eq!(registry.transport_count(), 1);
        assert!(registry.get_owned(&theirs.id, &other).is_ok());
    }
}
