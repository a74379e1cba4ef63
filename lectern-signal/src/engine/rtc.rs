//! WebRTC-backed media engine
//!
//! One `RTCPeerConnection` per transport. A send transport ingests the
//! host's RTP into per-kind broadcast channels; a receive transport fans
//! those packets out to a viewer through locally created tracks. The
//! handshake blobs exchanged over the signaling channel are SDP
//! offers/answers, opaque to everything above this module.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcCodecEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use super::{
    ConsumerHandle, EngineEvent, MediaEngine, ProducerHandle, RtpCapabilities,
    RtpCodecCapability, TransportHandle,
};
use crate::config::EngineConfig;
use crate::error::{Result, SignalError};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};

/// One transport: a peer connection plus, for the send direction, per-kind
/// RTP ingress slots
struct RtcTransport {
    id: TransportId,
    direction: TransportDirection,
    pc: Arc<RTCPeerConnection>,
    /// Per-kind ingress channels filled by the `on_track` handler
    audio_tx: broadcast::Sender<Packet>,
    video_tx: broadcast::Sender<Packet>,
    /// Codec of the arrived track, populated by `on_track`
    audio_codec: Arc<RwLock<Option<RTCRtpCodecCapability>>>,
    video_codec: Arc<RwLock<Option<RTCRtpCodecCapability>>>,
    /// SSRC of the arrived video track, for keyframe requests
    video_ssrc: Arc<AtomicU32>,
    keyframe_task_started: AtomicBool,
}

impl RtcTransport {
    fn ingress(&self, kind: MediaKind) -> &broadcast::Sender<Packet> {
        match kind {
            MediaKind::Audio => &self.audio_tx,
            MediaKind::Video => &self.video_tx,
        }
    }

    fn codec_slot(&self, kind: MediaKind) -> &Arc<RwLock<Option<RTCRtpCodecCapability>>> {
        match kind {
            MediaKind::Audio => &self.audio_codec,
            MediaKind::Video => &self.video_codec,
        }
    }
}

struct RtcProducer {
    kind: MediaKind,
    transport_id: TransportId,
    closed: AtomicBool,
}

struct RtcConsumer {
    cancel: CancellationToken,
}

/// WebRTC media engine
pub struct RtcEngine {
    api: API,
    config: EngineConfig,
    capabilities: RtpCapabilities,
    transports: DashMap<TransportId, Arc<RtcTransport>>,
    producers: Arc<DashMap<ProducerId, Arc<RtcProducer>>>,
    consumers: DashMap<ConsumerId, RtcConsumer>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl RtcEngine {
    /// Build the engine API once at process start
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let mut codec_engine = RtcCodecEngine::default();
        codec_engine
            .register_default_codecs()
            .map_err(|e| SignalError::EngineError(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codec_engine)
            .map_err(|e| SignalError::EngineError(e.to_string()))?;

        let mut setting_engine = SettingEngine::default();
        if config.udp_port_min > 0 && config.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                .map_err(|e| SignalError::EngineError(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            info!(
                udp_port_min = config.udp_port_min,
                udp_port_max = config.udp_port_max,
                "Engine UDP port range configured"
            );
        }
        if !config.public_host.is_empty() {
            // NAT1To1 requires IP addresses, not hostnames
            let nat_ip = if config.public_host == "localhost" {
                "127.0.0.1".to_string()
            } else {
                config.public_host.clone()
            };
            setting_engine.set_nat_1to1_ips(vec![nat_ip], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(codec_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            ice_servers = config.ice_servers.len(),
            "RTC engine initialized"
        );

        Ok(Arc::new(Self {
            api,
            config,
            capabilities: default_capabilities(),
            transports: DashMap::new(),
            producers: Arc::new(DashMap::new()),
            consumers: DashMap::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }))
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    fn get_transport(&self, transport_id: &TransportId) -> Result<Arc<RtcTransport>> {
        self.transports
            .get(transport_id)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))
    }

    /// Forward incoming RTP from the host's tracks into the per-kind ingress
    /// channels. Installed once per send transport.
    fn install_on_track(&self, transport: &Arc<RtcTransport>) {
        let transport_id = transport.id.clone();
        let audio_tx = transport.audio_tx.clone();
        let video_tx = transport.video_tx.clone();
        let audio_codec = Arc::clone(&transport.audio_codec);
        let video_codec = Arc::clone(&transport.video_codec);
        let video_ssrc = Arc::clone(&transport.video_ssrc);
        let producers = Arc::clone(&self.producers);
        let event_tx = self.event_tx.clone();

        transport
            .pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = if track.kind() == RTPCodecType::Audio {
                    MediaKind::Audio
                } else {
                    MediaKind::Video
                };
                info!(
                    transport_id = %transport_id,
                    kind = %kind,
                    ssrc = track.ssrc(),
                    codec = %track.codec().capability.mime_type,
                    "Track received"
                );

                let tx = match kind {
                    MediaKind::Audio => {
                        *audio_codec.write() = Some(track.codec().capability.clone());
                        audio_tx.clone()
                    }
                    MediaKind::Video => {
                        *video_codec.write() = Some(track.codec().capability.clone());
                        video_ssrc.store(track.ssrc(), Ordering::Relaxed);
                        video_tx.clone()
                    }
                };

                let transport_id = transport_id.clone();
                let producers = Arc::clone(&producers);
                let event_tx = event_tx.clone();

                Box::pin(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _attributes)) => {
                                // A send error only means there is currently
                                // no subscriber; keep reading
                                let _ = tx.send(packet);
                            }
                            Err(e) => {
                                debug!(
                                    transport_id = %transport_id,
                                    kind = %kind,
                                    error = %e,
                                    "RTP read ended"
                                );
                                break;
                            }
                        }
                    }

                    // The track ended; notify the coordinator so the bound
                    // producer is torn down through the normal cascade
                    for entry in producers.iter() {
                        let producer = entry.value();
                        if producer.transport_id == transport_id
                            && producer.kind == kind
                            && !producer.closed.load(Ordering::SeqCst)
                        {
                            let _ = event_tx.send(EngineEvent::ProducerClosed {
                                producer_id: entry.key().clone(),
                            });
                        }
                    }
                })
            }));
    }

    fn install_state_watch(&self, transport: &Arc<RtcTransport>) {
        let transport_id = transport.id.clone();
        let event_tx = self.event_tx.clone();
        let reported = Arc::new(AtomicBool::new(false));

        transport
            .pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                match state {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        if !reported.swap(true, Ordering::SeqCst) {
                            info!(
                                transport_id = %transport_id,
                                state = %state,
                                "Transport connection lost"
                            );
                            let _ = event_tx.send(EngineEvent::TransportClosed {
                                transport_id: transport_id.clone(),
                            });
                        }
                    }
                    _ => {
                        debug!(transport_id = %transport_id, state = %state, "Transport state");
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Periodically request keyframes from the host's video track so late
    /// joiners do not wait for the next natural keyframe
    fn spawn_keyframe_task(&self, transport: &Arc<RtcTransport>) {
        if transport.keyframe_task_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let pc = Arc::clone(&transport.pc);
        let video_ssrc = Arc::clone(&transport.video_ssrc);
        let transport_id = transport.id.clone();
        let interval = self.config.keyframe_request_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let ssrc = video_ssrc.load(Ordering::Relaxed);
                if ssrc == 0 {
                    continue;
                }
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: ssrc,
                };
                if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                    debug!(
                        transport_id = %transport_id,
                        error = %e,
                        "Keyframe request task stopped"
                    );
                    break;
                }
            }
        });
    }

    async fn wait_for_ice(&self, pc: &Arc<RTCPeerConnection>) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            if state == RTCIceGathererState::Complete {
                if let Some(t) = tx.lock().take() {
                    let _ = t.send(());
                }
            }
            Box::pin(async {})
        }));
        let _ = tokio::time::timeout(self.config.ice_gathering_timeout(), rx).await;
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    fn capabilities(&self) -> Result<RtpCapabilities> {
        Ok(self.capabilities.clone())
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportHandle> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| SignalError::EngineError(e.to_string()))?;

        let id = TransportId::new();
        let (audio_tx, _) = broadcast::channel(self.config.rtp_channel_capacity);
        let (video_tx, _) = broadcast::channel(self.config.rtp_channel_capacity);

        let transport = Arc::new(RtcTransport {
            id: id.clone(),
            direction,
            pc: Arc::new(pc),
            audio_tx,
            video_tx,
            audio_codec: Arc::new(RwLock::new(None)),
            video_codec: Arc::new(RwLock::new(None)),
            video_ssrc: Arc::new(AtomicU32::new(0)),
            keyframe_task_started: AtomicBool::new(false),
        });

        if direction == TransportDirection::Send {
            self.install_on_track(&transport);
        }
        self.install_state_watch(&transport);

        self.transports.insert(id.clone(), Arc::clone(&transport));

        info!(
            transport_id = %id,
            direction = %direction,
            total_transports = self.transports.len(),
            "Transport created"
        );

        Ok(TransportHandle {
            id: id.clone(),
            direction,
            parameters: json!({
                "transportId": id.as_str(),
                "sdpSemantics": "offer-answer",
            }),
        })
    }

    async fn connect_transport(&self, transport_id: &TransportId, remote: Value) -> Result<Value> {
        let transport = self.get_transport(transport_id)?;

        let sdp = remote["sdp"]
            .as_str()
            .ok_or_else(|| SignalError::EngineError("missing sdp in remote parameters".to_string()))?
            .to_string();
        let sdp_type = remote["type"].as_str().unwrap_or("offer");

        match sdp_type {
            "offer" => {
                let initial = transport.pc.remote_description().await.is_none();

                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| SignalError::EngineError(format!("invalid SDP offer: {e}")))?;
                transport
                    .pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| SignalError::EngineError(e.to_string()))?;

                let answer = transport
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| SignalError::EngineError(e.to_string()))?;
                transport
                    .pc
                    .set_local_description(answer)
                    .await
                    .map_err(|e| SignalError::EngineError(e.to_string()))?;

                if initial {
                    self.wait_for_ice(&transport.pc).await;
                }

                let local = transport.pc.local_description().await.ok_or_else(|| {
                    SignalError::EngineError(
                        "local description unavailable after ICE gathering".to_string(),
                    )
                })?;

                if transport.direction == TransportDirection::Send {
                    self.spawn_keyframe_task(&transport);
                }

                debug!(transport_id = %transport_id, initial = initial, "Transport handshake answered");

                Ok(json!({ "type": "answer", "sdp": local.sdp }))
            }
            "answer" => {
                // Completion of a renegotiation we initiated in `consume`
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| SignalError::EngineError(format!("invalid SDP answer: {e}")))?;
                transport
                    .pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| SignalError::EngineError(e.to_string()))?;
                Ok(Value::Null)
            }
            other => Err(SignalError::EngineError(format!(
                "unsupported description type: {other}"
            ))),
        }
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ProducerHandle> {
        let transport = self.get_transport(transport_id)?;
        if transport.direction != TransportDirection::Send {
            return Err(SignalError::EngineError(format!(
                "cannot produce on a {} transport",
                transport.direction
            )));
        }

        // One producer per media kind per transport: the ingress slots are
        // keyed by kind
        let duplicate = self.producers.iter().any(|entry| {
            let producer = entry.value();
            producer.transport_id == *transport_id
                && producer.kind == kind
                && !producer.closed.load(Ordering::SeqCst)
        });
        if duplicate {
            return Err(SignalError::EngineError(format!(
                "a {kind} producer already exists on transport {transport_id}"
            )));
        }

        let id = ProducerId::new();
        self.producers.insert(
            id.clone(),
            Arc::new(RtcProducer {
                kind,
                transport_id: transport_id.clone(),
                closed: AtomicBool::new(false),
            }),
        );

        info!(
            producer_id = %id,
            transport_id = %transport_id,
            kind = %kind,
            "Producer created"
        );

        Ok(ProducerHandle {
            id,
            kind,
            rtp_parameters,
        })
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<ConsumerHandle> {
        let transport = self.get_transport(transport_id)?;
        if transport.direction != TransportDirection::Recv {
            return Err(SignalError::EngineError(format!(
                "cannot consume on a {} transport",
                transport.direction
            )));
        }

        let producer = self
            .producers
            .get(producer_id)
            .map(|p| Arc::clone(p.value()))
            .filter(|p| !p.closed.load(Ordering::SeqCst))
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;

        let source = self
            .transports
            .get(&producer.transport_id)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;

        let remote_caps: RtpCapabilities = serde_json::from_value(rtp_capabilities)
            .map_err(|e| SignalError::IncompatibleCapabilities(e.to_string()))?;

        let codec = source
            .codec_slot(producer.kind)
            .read()
            .clone()
            .unwrap_or_else(|| default_codec(producer.kind));

        if !remote_caps.supports(&codec.mime_type) {
            return Err(SignalError::IncompatibleCapabilities(format!(
                "peer does not support {}",
                codec.mime_type
            )));
        }

        let id = ConsumerId::new();
        let track = Arc::new(TrackLocalStaticRTP::new(
            codec.clone(),
            producer.kind.as_str().to_string(),
            format!("lectern-{producer_id}"),
        ));

        transport
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SignalError::EngineError(format!("add_track failed: {e}")))?;

        // If the receive transport is already connected, adding a track needs
        // another offer/answer round; the offer rides back in the consumer
        // parameters and the peer completes it with one more connectTransport
        let renegotiation = if transport.pc.remote_description().await.is_some() {
            let offer = transport
                .pc
                .create_offer(None)
                .await
                .map_err(|e| SignalError::EngineError(e.to_string()))?;
            transport
                .pc
                .set_local_description(offer.clone())
                .await
                .map_err(|e| SignalError::EngineError(e.to_string()))?;
            json!({ "type": "offer", "sdp": offer.sdp })
        } else {
            Value::Null
        };

        // Consumers start resumed: begin forwarding immediately
        let cancel = CancellationToken::new();
        let rx = source.ingress(producer.kind).subscribe();
        spawn_fanout_task(rx, track, cancel.clone(), id.clone());

        // Ask the producer side for an immediate keyframe so video starts
        // without waiting for the next natural one
        let ssrc = source.video_ssrc.load(Ordering::Relaxed);
        if producer.kind == MediaKind::Video && ssrc != 0 {
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: ssrc,
            };
            if let Err(e) = source.pc.write_rtcp(&[Box::new(pli)]).await {
                warn!(producer_id = %producer_id, error = %e, "Initial keyframe request failed");
            }
        }

        self.consumers.insert(id.clone(), RtcConsumer { cancel });

        info!(
            consumer_id = %id,
            producer_id = %producer_id,
            transport_id = %transport_id,
            kind = %producer.kind,
            "Consumer created"
        );

        Ok(ConsumerHandle {
            id: id.clone(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters: json!({
                "codec": {
                    "mimeType": codec.mime_type,
                    "clockRate": codec.clock_rate,
                    "channels": codec.channels,
                    "sdpFmtpLine": codec.sdp_fmtp_line,
                },
                "renegotiation": renegotiation,
            }),
        })
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        if let Some((_, transport)) = self.transports.remove(transport_id) {
            if let Err(e) = transport.pc.close().await {
                debug!(transport_id = %transport_id, error = %e, "Transport close reported error");
            }
            info!(
                transport_id = %transport_id,
                remaining_transports = self.transports.len(),
                "Transport closed"
            );
        }
    }

    fn close_producer(&self, producer_id: &ProducerId) {
        if let Some(producer) = self.producers.get(producer_id) {
            if !producer.closed.swap(true, Ordering::SeqCst) {
                info!(producer_id = %producer_id, "Producer closed");
            }
        }
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        if let Some((_, consumer)) = self.consumers.remove(consumer_id) {
            consumer.cancel.cancel();
            info!(consumer_id = %consumer_id, "Consumer closed");
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.event_rx.lock().take()
    }
}

/// Forward packets from a producer's ingress channel into a viewer-facing
/// track until cancelled
fn spawn_fanout_task(
    mut rx: broadcast::Receiver<Packet>,
    track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    consumer_id: ConsumerId,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(consumer_id = %consumer_id, "Fan-out task cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(packet) => {
                            if let Err(e) = track.write_rtp(&packet).await {
                                debug!(consumer_id = %consumer_id, error = %e, "write_rtp failed, stopping fan-out");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(consumer_id = %consumer_id, skipped = n, "Slow consumer lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!(consumer_id = %consumer_id, "Ingress channel closed");
                            break;
                        }
                    }
                }
            }
        }
    });
}

fn default_codec(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn default_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: Some(2),
                parameters: Value::Null,
            },
            RtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: Value::Null,
            },
            RtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: Value::Null,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_cover_audio_and_video() {
        let engine = RtcEngine::new(EngineConfig::default()).expect("engine should build");
        let caps = engine.capabilities().expect("capabilities");
        assert!(caps.supports(MIME_TYPE_OPUS));
        assert!(caps.supports(MIME_TYPE_VP8));
    }

    #[tokio::test]
    async fn test_create_and_close_transport() {
        let engine = RtcEngine::new(EngineConfig::default()).expect("engine should build");

        let handle = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect("create transport");
        assert_eq!(handle.direction, TransportDirection::Send);
        assert_eq!(handle.parameters["transportId"], handle.id.as_str());

        engine.close_transport(&handle.id).await;
        // Second close is a no-op
        engine.close_transport(&handle.id).await;

        let err = engine
            .connect_transport(&handle.id, json!({ "sdp": "", "type": "offer" }))
            .await
            .expect_err("closed transport is gone");
        assert!(matches!(err, SignalError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_produce_requires_send_transport() {
        let engine = RtcEngine::new(EngineConfig::default()).expect("engine should build");
        let recv = engine
            .create_transport(TransportDirection::Recv)
            .await
            .expect("create transport");

        let err = engine
            .produce(&recv.id, MediaKind::Video, Value::Null)
            .await
            .expect_err("produce on recv transport should fail");
        assert!(matches!(err, SignalError::EngineError(_)));
    }

    #[tokio::test]
    async fn test_one_producer_per_kind_per_transport() {
        let engine = RtcEngine::new(EngineConfig::default()).expect("engine should build");
        let send = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect("create transport");

        let first = engine
            .produce(&send.id, MediaKind::Video, Value::Null)
            .await
            .expect("first producer");
        let err = engine
            .produce(&send.id, MediaKind::Video, Value::Null)
            .await
            .expect_err("duplicate kind should fail");
        assert!(matches!(err, SignalError::EngineError(_)));

        // Audio on the same transport is fine
        engine
            .produce(&send.id, MediaKind::Audio, Value::Null)
            .await
            .expect("audio producer");

        // After closing the video producer the slot is free again
        engine.close_producer(&first.id);
        engine
            .produce(&send.id, MediaKind::Video, Value::Null)
            .await
            .expect("slot free after close");
    }
}
