//! Session coordinator: the message-driven front controller
//!
//! One coordinator instance is constructed at process start and handed by
//! reference to every connection handler; there is no global mutable state.
//! Each inbound request is validated against registry state, dispatched, and
//! answered with exactly one acknowledgement.
//!
//! Engine-call discipline: preconditions are validated against the
//! registries, then the (suspending) engine call runs under a timeout with
//! no locks held, then the result is committed after re-validating that the
//! room or producer survived the suspension. A commit that finds its target
//! gone releases the fresh engine resource and fails the request.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{Result, SignalError};
use crate::hub::{EventSender, RoomHub};
use crate::protocol::{
    ClientRequest, ConnectTransportResponse, ConsumeResponse, CreateRoomResponse,
    CreateTransportResponse, EndLectureResponse, JoinLectureResponse, ParticipantInfo,
    ParticipantRole, ProduceResponse, ProducerInfo, ServerEvent,
};
use crate::registry::{PeerIndex, PeerRole, RoomRegistry, TransportRegistry};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

/// Front controller owning all shared signaling state
pub struct SessionCoordinator {
    engine: Arc<dyn MediaEngine>,
    hub: Arc<RoomHub>,
    rooms: RoomRegistry,
    transports: TransportRegistry,
    peers: PeerIndex,
    config: CoordinatorConfig,
}

impl SessionCoordinator {
    /// Create the coordinator and start its background tasks (heartbeat
    /// sweep, engine event listener)
    pub fn new(engine: Arc<dyn MediaEngine>, config: CoordinatorConfig) -> Arc<Self> {
        let hub = Arc::new(RoomHub::new());
        let coordinator = Arc::new(Self {
            rooms: RoomRegistry::new(
                Arc::clone(&hub),
                config.max_rooms,
                config.max_viewers_per_room,
            ),
            transports: TransportRegistry::new(Arc::clone(&engine)),
            peers: PeerIndex::new(config.max_peers),
            engine,
            hub,
            config,
        });

        info!(
            max_peers = coordinator.config.max_peers,
            max_rooms = coordinator.config.max_rooms,
            heartbeat_timeout_seconds = coordinator.config.heartbeat_timeout_seconds,
            "Session coordinator initialized"
        );

        let watchdog = Arc::clone(&coordinator);
        tokio::spawn(async move {
            watchdog.watchdog_task().await;
        });

        coordinator.spawn_engine_listener();

        coordinator
    }

    /// Register a new connection; the token tears the connection's request
    /// loop down when the coordinator evicts the peer
    pub fn connect(&self, display_name: &str, cancel: CancellationToken) -> Result<PeerId> {
        self.peers.register(display_name.to_string(), cancel)
    }

    /// Handle one request from a peer, returning the acknowledgement payload
    pub async fn handle_request(
        &self,
        peer_id: &PeerId,
        request: ClientRequest,
        sender: &EventSender,
    ) -> Result<Value> {
        self.peers.touch(peer_id);
        debug!(peer_id = %peer_id, request = request.kind(), "Handling request");

        match request {
            ClientRequest::GetRtpCapabilities => {
                let capabilities = self.engine.capabilities()?;
                to_payload(&capabilities)
            }
            ClientRequest::CreateRoom { room_id } => self.create_room(peer_id, &room_id, sender),
            ClientRequest::JoinLecture { room_id, user_info } => {
                self.peers
                    .set_display_name(peer_id, user_info.display_name);
                self.join_lecture(peer_id, &room_id, sender)
            }
            ClientRequest::CreateTransport { room_id, direction } => {
                self.create_transport(peer_id, &room_id, direction).await
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.transports.get_owned(&transport_id, peer_id)?;
                let connection = self
                    .engine_call(self.engine.connect_transport(&transport_id, dtls_parameters))
                    .await?;
                to_payload(&ConnectTransportResponse { connection })
            }
            ClientRequest::Produce {
                room_id,
                transport_id,
                kind,
                rtp_parameters,
            } => {
                self.produce(peer_id, &room_id, &transport_id, kind, rtp_parameters)
                    .await
            }
            ClientRequest::ConsumeProducer {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.consume(peer_id, &transport_id, &producer_id, rtp_capabilities)
                    .await
            }
            ClientRequest::EndLecture { room_id } => self.end_lecture(peer_id, &room_id).await,
            ClientRequest::ChatMessage { room_id, text } => {
                self.chat_message(peer_id, &room_id, text)
            }
            ClientRequest::Typing { room_id, is_typing } => {
                let _ = self.require_member(peer_id, &room_id)?;
                self.hub.broadcast_except(
                    &room_id,
                    peer_id,
                    ServerEvent::UserTyping {
                        peer_id: peer_id.clone(),
                        is_typing,
                    },
                );
                Ok(Value::Null)
            }
            ClientRequest::Heartbeat => Ok(Value::Null),
        }
    }

    fn create_room(
        &self,
        peer_id: &PeerId,
        room_id: &RoomId,
        sender: &EventSender,
    ) -> Result<Value> {
        if self.peers.role_of(peer_id).is_some() {
            return Err(SignalError::Unauthorized(
                "peer already joined a room".to_string(),
            ));
        }
        let display_name = self
            .peers
            .display_name(peer_id)
            .ok_or_else(|| SignalError::Unauthorized("unknown peer".to_string()))?;

        let host = ParticipantInfo {
            peer_id: peer_id.clone(),
            display_name,
            role: ParticipantRole::Host,
        };
        let reclaimed = self.rooms.create_room(room_id, host, sender.clone())?;

        if let Err(e) = self.peers.set_role(
            peer_id,
            PeerRole::Host {
                room: room_id.clone(),
            },
        ) {
            // The connection vanished mid-request; unwind the registry
            self.rooms.set_host_absent(room_id);
            self.hub.unsubscribe(peer_id);
            return Err(e);
        }

        to_payload(&CreateRoomResponse {
            room_id: room_id.clone(),
            reclaimed,
        })
    }

    fn join_lecture(
        &self,
        peer_id: &PeerId,
        room_id: &RoomId,
        sender: &EventSender,
    ) -> Result<Value> {
        if self.peers.role_of(peer_id).is_some() {
            return Err(SignalError::Unauthorized(
                "peer already joined a room".to_string(),
            ));
        }
        let display_name = self
            .peers
            .display_name(peer_id)
            .ok_or_else(|| SignalError::Unauthorized("unknown peer".to_string()))?;

        let viewer = ParticipantInfo {
            peer_id: peer_id.clone(),
            display_name,
            role: ParticipantRole::Viewer,
        };
        let (producers, participants) =
            self.rooms
                .join_as_viewer(room_id, viewer, sender.clone())?;

        if let Err(e) = self.peers.set_role(
            peer_id,
            PeerRole::Viewer {
                room: room_id.clone(),
            },
        ) {
            self.rooms.remove_viewer(room_id, peer_id);
            self.hub.unsubscribe(peer_id);
            return Err(e);
        }

        to_payload(&JoinLectureResponse {
            producers,
            participants,
        })
    }

    async fn create_transport(
        &self,
        peer_id: &PeerId,
        room_id: &RoomId,
        direction: TransportDirection,
    ) -> Result<Value> {
        let _ = self.require_member(peer_id, room_id)?;

        // Fail fast before spending an engine allocation on an occupied slot
        if self.transports.has_slot(peer_id, direction) {
            return Err(SignalError::TransportAlreadyExists(format!(
                "{direction} transport for peer {peer_id}"
            )));
        }

        let handle = self
            .engine_call(self.engine.create_transport(direction))
            .await?;

        // The room may have died while the engine call was in flight
        if !self.rooms.is_active(room_id) {
            self.engine.close_transport(&handle.id).await;
            return Err(SignalError::RoomNotFound(room_id.to_string()));
        }

        if let Err(e) = self
            .transports
            .register(peer_id.clone(), direction, handle.id.clone())
        {
            // Lost a slot race against a concurrent request from this peer
            self.engine.close_transport(&handle.id).await;
            return Err(e);
        }
        self.peers.add_transport(peer_id, handle.id.clone());

        to_payload(&CreateTransportResponse {
            transport_id: handle.id,
            direction,
            parameters: handle.parameters,
        })
    }

    async fn produce(
        &self,
        peer_id: &PeerId,
        room_id: &RoomId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Value> {
        self.require_host(peer_id, room_id)?;
        let _ = self.transports.get_owned(transport_id, peer_id)?;

        let handle = self
            .engine_call(self.engine.produce(transport_id, kind, rtp_parameters))
            .await?;

        let entry = ProducerInfo {
            id: handle.id.clone(),
            kind,
            peer_id: peer_id.clone(),
        };
        // Commit re-validates room existence; announcement happens in the
        // same critical section as the registration
        if let Err(e) = self.rooms.add_producer(room_id, entry) {
            self.engine.close_producer(&handle.id);
            return Err(e);
        }
        self.peers.add_producer(peer_id, handle.id.clone());

        info!(
            peer_id = %peer_id,
            room_id = %room_id,
            producer_id = %handle.id,
            kind = %kind,
            "Producer committed"
        );

        to_payload(&ProduceResponse {
            producer_id: handle.id,
        })
    }

    async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<Value> {
        let role = self.require_role(peer_id)?;
        if role.is_host() {
            return Err(SignalError::Unauthorized(
                "the host does not consume".to_string(),
            ));
        }
        let room_id = role.room().clone();

        self.rooms
            .find_producer(&room_id, producer_id)
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;
        let _ = self.transports.get_owned(transport_id, peer_id)?;

        let handle = self
            .engine_call(
                self.engine
                    .consume(transport_id, producer_id, rtp_capabilities),
            )
            .await?;

        // The producer may have closed while the engine call was in flight
        if self.rooms.find_producer(&room_id, producer_id).is_none() {
            self.engine.close_consumer(&handle.id);
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        }
        self.peers
            .add_consumer(peer_id, handle.id.clone(), producer_id.clone());

        to_payload(&ConsumeResponse {
            consumer_id: handle.id,
            producer_id: producer_id.clone(),
            kind: handle.kind,
            rtp_parameters: handle.rtp_parameters,
        })
    }

    async fn end_lecture(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<Value> {
        self.require_host(peer_id, room_id)?;

        self.hub.broadcast(
            room_id,
            ServerEvent::LectureEnded {
                message: "The lecture has ended".to_string(),
            },
        );

        let (producers, consumers, transports) =
            self.peers.drain_resources(peer_id).unwrap_or_default();
        self.release_resources(peer_id, Some(room_id), producers, consumers, transports)
            .await;
        self.rooms.set_host_absent(room_id);
        self.hub.unsubscribe(peer_id);
        self.peers.clear_role(peer_id);

        info!(peer_id = %peer_id, room_id = %room_id, "Lecture ended by host");

        to_payload(&EndLectureResponse {
            room_id: room_id.clone(),
        })
    }

    fn chat_message(&self, peer_id: &PeerId, room_id: &RoomId, text: String) -> Result<Value> {
        let role = self.require_member(peer_id, room_id)?;
        let display_name = self.peers.display_name(peer_id).unwrap_or_default();

        let max_chars = self.config.max_chat_message_chars;
        let text = if max_chars > 0 && text.chars().count() > max_chars {
            text.chars().take(max_chars).collect()
        } else {
            text
        };

        self.hub.broadcast(
            room_id,
            ServerEvent::ChatMessage {
                from: ParticipantInfo {
                    peer_id: peer_id.clone(),
                    display_name,
                    role: participant_role(&role),
                },
                text,
                sent_at: Utc::now(),
            },
        );
        Ok(Value::Null)
    }

    /// Transactional cleanup for a disconnecting peer: producers (with their
    /// closure broadcasts and consumer cascades), own consumers, transports,
    /// then room membership. Idempotent, and trivial for a peer that never
    /// joined anything.
    pub async fn disconnect(&self, peer_id: &PeerId) {
        let Some((producers, consumers, transports)) = self.peers.drain_resources(peer_id) else {
            return;
        };
        let role = self.peers.role_of(peer_id);
        let room_id = role.as_ref().map(|r| r.room().clone());

        info!(
            peer_id = %peer_id,
            producers = producers.len(),
            consumers = consumers.len(),
            transports = transports.len(),
            "Disconnect cleanup started"
        );

        self.release_resources(peer_id, room_id.as_ref(), producers, consumers, transports)
            .await;

        match role {
            Some(PeerRole::Host { room }) => {
                self.rooms.set_host_absent(&room);
            }
            Some(PeerRole::Viewer { room }) => {
                self.rooms.remove_viewer(&room, peer_id);
            }
            None => {}
        }

        self.hub.unsubscribe(peer_id);
        if let Some(state) = self.peers.remove(peer_id) {
            state.cancel.cancel();
        }
    }

    async fn release_resources(
        &self,
        peer_id: &PeerId,
        room_id: Option<&RoomId>,
        producers: Vec<ProducerId>,
        consumers: Vec<ConsumerId>,
        transports: Vec<TransportId>,
    ) {
        for producer_id in producers {
            self.engine.close_producer(&producer_id);
            if let Some(room_id) = room_id {
                self.rooms.remove_producer(room_id, &producer_id);
            }
            self.cascade_consumers(&producer_id);
        }
        for consumer_id in consumers {
            self.engine.close_consumer(&consumer_id);
        }
        for transport_id in transports {
            self.transports.close(&transport_id).await;
        }
        debug!(peer_id = %peer_id, "Peer resources released");
    }

    /// Close every consumer bound to a producer that just closed
    fn cascade_consumers(&self, producer_id: &ProducerId) {
        for (peer_id, consumer_id) in self.peers.consumers_of_producer(producer_id) {
            if self.peers.remove_consumer(&peer_id, &consumer_id) {
                self.engine.close_consumer(&consumer_id);
                debug!(
                    peer_id = %peer_id,
                    consumer_id = %consumer_id,
                    producer_id = %producer_id,
                    "Consumer closed with its producer"
                );
            }
        }
    }

    fn require_role(&self, peer_id: &PeerId) -> Result<PeerRole> {
        self.peers
            .role_of(peer_id)
            .ok_or_else(|| SignalError::Unauthorized("join a room first".to_string()))
    }

    fn require_member(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<PeerRole> {
        let role = self.require_role(peer_id)?;
        if role.room() != room_id {
            return Err(SignalError::Unauthorized(
                "peer is not a member of this room".to_string(),
            ));
        }
        Ok(role)
    }

    /// Only the recorded host of the named room may run privileged
    /// operations; the registry is consulted so a stale role cannot outlive
    /// a reclaim
    fn require_host(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<()> {
        let role = self.require_member(peer_id, room_id)?;
        if !role.is_host() || self.rooms.host_of(room_id).as_ref() != Some(peer_id) {
            return Err(SignalError::Unauthorized(
                "only the host may do this".to_string(),
            ));
        }
        Ok(())
    }

    /// Bound a suspending engine call; on timeout nothing is committed and
    /// the request fails as an engine error
    async fn engine_call<T>(
        &self,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.engine_call_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(SignalError::EngineError(
                "engine call timed out".to_string(),
            )),
        }
    }

    async fn watchdog_task(self: Arc<Self>) {
        let mut ticker = interval(self.config.heartbeat_sweep_interval());
        info!(
            sweep_interval_seconds = self.config.heartbeat_sweep_interval_seconds,
            "Starting heartbeat watchdog"
        );

        loop {
            ticker.tick().await;
            for peer_id in self.peers.stale_peers(self.config.heartbeat_timeout()) {
                warn!(peer_id = %peer_id, "Heartbeat timeout, disconnecting peer");
                self.disconnect(&peer_id).await;
            }
        }
    }

    /// Cascade engine-originated closes (track ended, transport died) into
    /// the registries. Races with request-path cleanup are resolved by the
    /// idempotent removers.
    fn spawn_engine_listener(self: &Arc<Self>) {
        let Some(mut events) = self.engine.take_events() else {
            error!("Engine event stream already taken; engine cascades disabled");
            return;
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::ProducerClosed { producer_id } => {
                        coordinator.on_engine_producer_closed(&producer_id);
                    }
                    EngineEvent::TransportClosed { transport_id } => {
                        coordinator.on_engine_transport_closed(&transport_id).await;
                    }
                }
            }
            debug!("Engine event stream ended");
        });
    }

    fn on_engine_producer_closed(&self, producer_id: &ProducerId) {
        let Some(owner) = self.peers.owner_of_producer(producer_id) else {
            return; // Already cleaned up through the signaling path
        };
        if !self.peers.remove_producer(&owner, producer_id) {
            return;
        }
        info!(producer_id = %producer_id, peer_id = %owner, "Engine reported producer closed");

        self.engine.close_producer(producer_id);
        if let Some(room_id) = self.rooms.find_producer_room(producer_id) {
            self.rooms.remove_producer(&room_id, producer_id);
        }
        self.cascade_consumers(producer_id);
    }

    async fn on_engine_transport_closed(&self, transport_id: &TransportId) {
        if let Some(owner) = self.peers.owner_of_transport(transport_id) {
            self.peers.remove_transport(&owner, transport_id);
            info!(transport_id = %transport_id, peer_id = %owner, "Engine reported transport closed");
        }
        self.transports.close(transport_id).await;
    }

    /// Number of active rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.room_count()
    }

    /// Number of connected peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    /// Number of live transports
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.transport_count()
    }
}

fn participant_role(role: &PeerRole) -> ParticipantRole {
    if role.is_host() {
        ParticipantRole::Host
    } else {
        ParticipantRole::Viewer
    }
}

fn to_payload<T: serde::Serialize>(payload: &T) -> Result<Value> {
    serde_json::to_value(payload)
        .map_err(|e| SignalError::EngineError(format!("response serialization failed: {e}")))
}
