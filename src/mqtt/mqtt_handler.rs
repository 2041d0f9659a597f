//! rumqttc backed [`Transport`]
//!
//! Connecting polls the event loop until the broker's ConnAck. From then on an
//! event pump task owns the event loop and forwards broker notifications into
//! the inbound event channel until the connection drops or is closed.
//!
//! ```text
//! AsyncClient ──requests──► EventLoop ──(pump task)──► TransportEvent channel
//! ```
//!
//! Only the session task drains the event channel, and it is the one waiting
//! in [`Transport::disconnect`]. Once a disconnect starts the pump therefore
//! never waits for channel capacity; events that do not fit are dropped.

use super::config::MqttConfig;
use super::error::TransportError;
use super::message_manager::MqttMessage;
use super::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Topics of requests that are queued or awaiting their acknowledgment
///
/// rumqttc reports `Outgoing::Subscribe(pkid)` in request order, which is how a
/// SubAck gets matched back to the topic it belongs to.
#[derive(Debug, Default)]
struct PendingRequests {
    queued_subscribes: VecDeque<String>,
    subscribes: HashMap<u16, String>,
    queued_unsubscribes: VecDeque<String>,
    unsubscribes: HashMap<u16, String>,
}

impl PendingRequests {
    fn clear(&mut self) {
        self.queued_subscribes.clear();
        self.subscribes.clear();
        self.queued_unsubscribes.clear();
        self.unsubscribes.clear();
    }
}

/// Upper bound for the event pump to wind down after a disconnect request
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands `event` to the session, returns false once the channel is closed
///
/// Waits for capacity only until `stopping` fires.
async fn forward(
    events: &mpsc::Sender<TransportEvent>,
    event: TransportEvent,
    stopping: &CancellationToken,
) -> bool {
    if !stopping.is_cancelled() {
        tokio::select! {
            biased;
            permit = events.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(event);
                        true
                    }
                    Err(_) => false,
                };
            }
            _ = stopping.cancelled() => {}
        }
    }

    match events.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            debug!("Disconnecting, dropping {:?}", event);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    event_loop: Arc<Mutex<EventLoop>>,
    events: mpsc::Sender<TransportEvent>,
    pending: Arc<StdMutex<PendingRequests>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    /// Fresh per connection, cancelled when a disconnect starts
    disconnecting: StdMutex<CancellationToken>,
    closed: AtomicBool,
}

impl MqttTransport {
    /// Builds the client handle for the configured broker
    ///
    /// Nothing touches the network until [`Transport::connect`].
    pub fn new(
        config: &MqttConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let client_id = config.client_id.trim();
        if client_id.is_empty() || client_id != config.client_id {
            return Err(TransportError::InvalidClientId(config.client_id.clone()));
        }
        let (host, port) = config.server.host_and_port()?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)))
            .set_clean_session(true);
        if !config.server.user.is_empty() {
            mqtt_options.set_credentials(config.server.user.clone(), config.server.pw.clone());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, config.request_capacity.max(1));
        info!(
            "MQTT client {} initialized for {}",
            config.client_id, config.server
        );

        Ok(Self {
            client,
            event_loop: Arc::new(Mutex::new(event_loop)),
            events,
            pending: Arc::new(StdMutex::new(PendingRequests::default())),
            pump: StdMutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            disconnecting: StdMutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn stop_pump(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }

    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!("ConnAck received: {:?}", ack);
                    return Ok(());
                }
                Ok(event) => debug!("Event while connecting: {:?}", event),
                Err(e) => return Err(TransportError::ConnectionFailed(e.to_string())),
            }
        }
    }

    fn spawn_pump(
        &self,
        event_loop: OwnedMutexGuard<EventLoop>,
        stopping: CancellationToken,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let pending = self.pending.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            let mut event_loop = event_loop;
            debug!("Event pump started");
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("Disconnect sent, stopping event pump");
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(event) => {
                        if let Some(event) = Self::translate(event, &pending) {
                            if !forward(&events, event, &stopping).await {
                                warn!("Inbound event channel closed, stopping event pump");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        if stopping.is_cancelled() {
                            debug!("Event loop ended during disconnect: {}", e);
                        } else {
                            error!("MQTT event loop error: {}", e);
                            let _ = events.send(TransportEvent::ConnectionLost(e.to_string())).await;
                        }
                        break;
                    }
                }
            }
            debug!("Event pump stopped");
        })
    }

    /// Maps a rumqttc event onto the inbound notifications the session cares about
    fn translate(event: Event, pending: &StdMutex<PendingRequests>) -> Option<TransportEvent> {
        match event {
            Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::MessageArrived(
                MqttMessage::from_payload(publish.topic, &publish.payload),
            )),
            Event::Incoming(Packet::PubAck(ack)) => Some(TransportEvent::DeliveryComplete(ack.pkid)),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut pending = lock(pending);
                if let Some(topic) = pending.queued_subscribes.pop_front() {
                    pending.subscribes.insert(pkid, topic);
                }
                None
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let topic = lock(pending).subscribes.remove(&ack.pkid)?;
                let result = match ack.return_codes.first() {
                    Some(SubscribeReasonCode::Success(qos)) => Ok(*qos),
                    Some(SubscribeReasonCode::Failure) | None => Err(
                        TransportError::RequestFailed("broker rejected subscription".to_string()),
                    ),
                };
                Some(TransportEvent::SubscribeAck { topic, result })
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                let mut pending = lock(pending);
                if let Some(topic) = pending.queued_unsubscribes.pop_front() {
                    pending.unsubscribes.insert(pkid, topic);
                }
                None
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                let topic = lock(pending).unsubscribes.remove(&ack.pkid)?;
                Some(TransportEvent::UnsubscribeAck { topic })
            }
            other => {
                debug!("MQTT event: {:?}", other);
                None
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.stop_pump();
        let stopping = CancellationToken::new();
        *lock(&self.disconnecting) = stopping.clone();
        lock(&self.pending).clear();

        let mut event_loop = self.event_loop.clone().lock_owned().await;
        match tokio::time::timeout(timeout, Self::wait_for_connack(&mut event_loop)).await {
            Err(_) => Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::SeqCst);
                let pump = self.spawn_pump(event_loop, stopping);
                *lock(&self.pump) = Some(pump);
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.ensure_usable()?;
        lock(&self.disconnecting).cancel();
        let requested = self
            .client
            .try_disconnect()
            .map_err(|e| TransportError::RequestFailed(e.to_string()));

        let pump = lock(&self.pump).take();
        if let Some(mut pump) = pump {
            if requested.is_err() {
                pump.abort();
            }
            match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut pump).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => debug!("Event pump aborted"),
                Ok(Err(e)) => warn!("Event pump ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Event pump still running after {}s, aborting it",
                        DISCONNECT_TIMEOUT.as_secs()
                    );
                    pump.abort();
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        requested
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        self.ensure_usable()?;
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| TransportError::RequestFailed(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_usable()?;
        // Queue position and request order have to match, hold the lock across both
        let mut pending = lock(&self.pending);
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;
        pending.queued_subscribes.push_back(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let mut pending = lock(&self.pending);
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;
        pending.queued_unsubscribes.push_back(topic.to_string());
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_pump();
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.pending).clear();
        info!("MQTT client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttServer;
    use rumqttc::{Publish, SubAck, UnsubAck};

    fn config(url: &str, client_id: &str) -> MqttConfig {
        MqttConfig {
            server: MqttServer {
                url: url.to_string(),
                ..Default::default()
            },
            client_id: client_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn construction_validates_address_and_client_id() {
        let (tx, _rx) = mpsc::channel(8);
        assert!(MqttTransport::new(&config("127.0.0.1:1883", "dock"), tx.clone()).is_ok());
        assert!(matches!(
            MqttTransport::new(&config("127.0.0.1:1883", ""), tx.clone()),
            Err(TransportError::InvalidClientId(_))
        ));
        assert!(matches!(
            MqttTransport::new(&config(" dock", " dock"), tx.clone()),
            Err(TransportError::InvalidClientId(_))
        ));
        assert!(matches!(
            MqttTransport::new(&config(":1883", "dock"), tx),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn requests_while_disconnected_are_refused() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = MqttTransport::new(&config("127.0.0.1:1883", "dock"), tx).unwrap();
        assert_eq!(
            transport.subscribe("device/info", QoS::AtLeastOnce).await,
            Err(TransportError::NotConnected)
        );
        transport.close().await;
        assert_eq!(
            transport.publish("t", Vec::new(), QoS::AtLeastOnce).await,
            Err(TransportError::Closed)
        );
        assert_eq!(
            transport.connect(Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn acknowledgments_are_matched_to_topics() {
        let pending = StdMutex::new(PendingRequests::default());
        lock(&pending)
            .queued_subscribes
            .extend(["a".to_string(), "b".to_string()]);

        assert!(MqttTransport::translate(Event::Outgoing(Outgoing::Subscribe(7)), &pending).is_none());
        assert!(MqttTransport::translate(Event::Outgoing(Outgoing::Subscribe(8)), &pending).is_none());

        let ack = SubAck::new(8, vec![SubscribeReasonCode::Failure]);
        assert_eq!(
            MqttTransport::translate(Event::Incoming(Packet::SubAck(ack)), &pending),
            Some(TransportEvent::SubscribeAck {
                topic: "b".to_string(),
                result: Err(TransportError::RequestFailed(
                    "broker rejected subscription".to_string()
                )),
            })
        );

        let ack = SubAck::new(7, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(
            MqttTransport::translate(Event::Incoming(Packet::SubAck(ack)), &pending),
            Some(TransportEvent::SubscribeAck {
                topic: "a".to_string(),
                result: Ok(QoS::AtLeastOnce),
            })
        );

        lock(&pending).queued_unsubscribes.push_back("c".to_string());
        MqttTransport::translate(Event::Outgoing(Outgoing::Unsubscribe(9)), &pending);
        assert_eq!(
            MqttTransport::translate(Event::Incoming(Packet::UnsubAck(UnsubAck::new(9))), &pending),
            Some(TransportEvent::UnsubscribeAck {
                topic: "c".to_string()
            })
        );
    }

    #[test]
    fn publishes_become_messages() {
        let pending = StdMutex::new(PendingRequests::default());
        let publish = Publish::new("device/info", QoS::AtLeastOnce, "{}");
        match MqttTransport::translate(Event::Incoming(Packet::Publish(publish)), &pending) {
            Some(TransportEvent::MessageArrived(message)) => {
                assert_eq!(message.topic(), "device/info");
                assert_eq!(message.content(), "{}");
            }
            other => panic!("unexpected translation: {:?}", other),
        }
    }

    #[tokio::test]
    async fn forwarding_stops_waiting_once_disconnecting() {
        let (tx, mut rx) = mpsc::channel(1);
        let stopping = CancellationToken::new();
        assert!(forward(&tx, TransportEvent::DeliveryComplete(1), &stopping).await);

        let blocked = tokio::spawn({
            let tx = tx.clone();
            let stopping = stopping.clone();
            async move { forward(&tx, TransportEvent::DeliveryComplete(2), &stopping).await }
        });
        tokio::task::yield_now().await;
        stopping.cancel();
        let delivered = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("forward kept waiting for capacity")
            .unwrap();
        assert!(delivered);
        assert!(forward(&tx, TransportEvent::DeliveryComplete(3), &stopping).await);

        assert_eq!(rx.recv().await, Some(TransportEvent::DeliveryComplete(1)));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!forward(&tx, TransportEvent::DeliveryComplete(4), &stopping).await);
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_refused() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = MqttTransport::new(&config("127.0.0.1:1883", "dock"), tx).unwrap();
        assert_eq!(transport.disconnect().await, Err(TransportError::NotConnected));
    }
}
