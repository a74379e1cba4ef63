//! Deterministic in-process media engine
//!
//! Allocates ids and fabricates parameter blobs without touching the
//! network. Used by the coordinator tests and anywhere a real transport
//! engine is not wanted; failure modes can be armed per call.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ConsumerHandle, EngineEvent, MediaEngine, ProducerHandle, RtpCapabilities, RtpCodecCapability,
    TransportHandle,
};
use crate::error::{Result, SignalError};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};

#[derive(Debug)]
struct MockTransport {
    direction: TransportDirection,
    connected: AtomicBool,
}

#[derive(Debug)]
struct MockProducer {
    kind: MediaKind,
    closed: AtomicBool,
}

/// In-process engine for tests
pub struct MockEngine {
    not_ready: AtomicBool,
    transports: DashMap<TransportId, MockTransport>,
    producers: DashMap<ProducerId, MockProducer>,
    consumers: DashMap<ConsumerId, ProducerId>,
    /// Error returned by the next engine call, then cleared
    fail_next: Mutex<Option<SignalError>>,
    /// Artificial latency applied to every async engine call
    latency: Mutex<Option<Duration>>,
    closed_transports: AtomicUsize,
    closed_producers: AtomicUsize,
    closed_consumers: AtomicUsize,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            not_ready: AtomicBool::new(false),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            fail_next: Mutex::new(None),
            latency: Mutex::new(None),
            closed_transports: AtomicUsize::new(0),
            closed_producers: AtomicUsize::new(0),
            closed_consumers: AtomicUsize::new(0),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Inject an engine-originated lifecycle event, as a real engine would on
    /// track end or transport failure
    pub fn emit_event(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Make `capabilities` fail with `EngineNotReady` until cleared
    pub fn set_ready(&self, ready: bool) {
        self.not_ready.store(!ready, Ordering::SeqCst);
    }

    /// Arm the next engine call to fail with the given error
    pub fn fail_next(&self, err: SignalError) {
        *self.fail_next.lock() = Some(err);
    }

    /// Delay every async engine call, for exercising caller-side timeouts
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn closed_transport_count(&self) -> usize {
        self.closed_transports.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closed_producer_count(&self) -> usize {
        self.closed_producers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closed_consumer_count(&self) -> usize {
        self.closed_consumers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transport_connected(&self, transport_id: &TransportId) -> bool {
        self.transports
            .get(transport_id)
            .is_some_and(|t| t.connected.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn producer_closed(&self, producer_id: &ProducerId) -> bool {
        self.producers
            .get(producer_id)
            .is_some_and(|p| p.closed.load(Ordering::SeqCst))
    }

    async fn pre_call(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn capabilities(&self) -> Result<RtpCapabilities> {
        if self.not_ready.load(Ordering::SeqCst) {
            return Err(SignalError::EngineNotReady);
        }
        Ok(RtpCapabilities {
            codecs: vec![
                RtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: Value::Null,
                },
                RtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    parameters: Value::Null,
                },
            ],
        })
    }

    async fn create_transport(&self, direction: TransportDirection) -> Result<TransportHandle> {
        self.pre_call().await?;

        let id = TransportId::new();
        self.transports.insert(
            id.clone(),
            MockTransport {
                direction,
                connected: AtomicBool::new(false),
            },
        );

        Ok(TransportHandle {
            id: id.clone(),
            direction,
            parameters: json!({
                "transportId": id.as_str(),
                "iceCandidates": [{ "ip": "127.0.0.1", "port": 40000 }],
                "dtlsFingerprint": "mock",
            }),
        })
    }

    async fn connect_transport(&self, transport_id: &TransportId, _remote: Value) -> Result<Value> {
        self.pre_call().await?;

        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))?;
        transport.connected.store(true, Ordering::SeqCst);
        Ok(Value::Null)
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ProducerHandle> {
        self.pre_call().await?;

        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))?;
        if transport.direction != TransportDirection::Send {
            return Err(SignalError::EngineError(format!(
                "cannot produce on a {} transport",
                transport.direction
            )));
        }

        let id = ProducerId::new();
        self.producers.insert(
            id.clone(),
            MockProducer {
                kind,
                closed: AtomicBool::new(false),
            },
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
        self.pre_call().await?;

        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))?;
        if transport.direction != TransportDirection::Recv {
            return Err(SignalError::EngineError(format!(
                "cannot consume on a {} transport",
                transport.direction
            )));
        }

        let producer = self
            .producers
            .get(producer_id)
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;
        let kind = producer.kind;

        // Codec match: the consumer's capabilities must list a codec of the
        // producer's media kind
        let wanted_prefix = format!("{kind}/");
        let compatible = rtp_capabilities["codecs"]
            .as_array()
            .is_some_and(|codecs| {
                codecs.iter().any(|codec| {
                    codec["mimeType"]
                        .as_str()
                        .is_some_and(|mime| mime.to_lowercase().starts_with(&wanted_prefix))
                })
            });
        if !compatible {
            return Err(SignalError::IncompatibleCapabilities(format!(
                "no {kind} codec offered for producer {producer_id}"
            )));
        }

        let id = ConsumerId::new();
        self.consumers.insert(id.clone(), producer_id.clone());

        Ok(ConsumerHandle {
            id: id.clone(),
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters: json!({
                "consumerId": id.as_str(),
                "paused": false,
            }),
        })
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        if self.transports.remove(transport_id).is_some() {
            self.closed_transports.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close_producer(&self, producer_id: &ProducerId) {
        if let Some(producer) = self.producers.get(producer_id) {
            if !producer.closed.swap(true, Ordering::SeqCst) {
                self.closed_producers.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        if self.consumers.remove(consumer_id).is_some() {
            self.closed_consumers.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.event_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewer_caps() -> Value {
        json!({ "codecs": [
            { "mimeType": "audio/opus" },
            { "mimeType": "video/VP8" },
        ]})
    }

    #[tokio::test]
    async fn test_not_ready() {
        let engine = MockEngine::new();
        engine.set_ready(false);
        assert_eq!(
            engine.capabilities().expect_err("should fail"),
            SignalError::EngineNotReady
        );

        engine.set_ready(true);
        assert!(engine.capabilities().is_ok());
    }

    #[tokio::test]
    async fn test_produce_requires_send_transport() {
        let engine = MockEngine::new();
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
    async fn test_consume_checks_capabilities() {
        let engine = MockEngine::new();
        let send = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect("create send transport");
        let recv = engine
            .create_transport(TransportDirection::Recv)
            .await
            .expect("create recv transport");
        let producer = engine
            .produce(&send.id, MediaKind::Video, Value::Null)
            .await
            .expect("produce");

        let err = engine
            .consume(
                &recv.id,
                &producer.id,
                json!({ "codecs": [{ "mimeType": "audio/opus" }] }),
            )
            .await
            .expect_err("audio-only caps cannot consume video");
        assert!(matches!(err, SignalError::IncompatibleCapabilities(_)));

        let consumer = engine
            .consume(&recv.id, &producer.id, viewer_caps())
            .await
            .expect("consume");
        assert_eq!(consumer.producer_id, producer.id);
        assert_eq!(consumer.kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn test_closes_are_idempotent() {
        let engine = MockEngine::new();
        let send = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect("create transport");
        assert!(!engine.transport_connected(&send.id));
        engine
            .connect_transport(&send.id, Value::Null)
            .await
            .expect("connect");
        assert!(engine.transport_connected(&send.id));

        let producer = engine
            .produce(&send.id, MediaKind::Audio, Value::Null)
            .await
            .expect("produce");

        engine.close_producer(&producer.id);
        engine.close_producer(&producer.id);
        assert_eq!(engine.closed_producer_count(), 1);
        assert!(engine.producer_closed(&producer.id));

        engine.close_transport(&send.id).await;
        engine.close_transport(&send.id).await;
        assert_eq!(engine.closed_transport_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let engine = MockEngine::new();
        engine.fail_next(SignalError::EngineError("allocation failed".to_string()));

        let err = engine
            .create_transport(TransportDirection::Send)
            .await
            .expect_err("armed failure should fire");
        assert!(matches!(err, SignalError::EngineError(_)));

        assert!(engine.create_transport(TransportDirection::Send).await.is_ok());
    }
}
