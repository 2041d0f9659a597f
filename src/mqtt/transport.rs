//! Transport seam between the session and the broker client
//!
//! The broker client reports asynchronous notifications (connection lost,
//! message arrived, delivery confirmed, subscription acknowledged) as
//! [`TransportEvent`]s on a channel that the session task consumes. Nothing in
//! the transport mutates session state directly.

use super::error::TransportError;
use super::message_manager::MqttMessage;
use async_trait::async_trait;
use rumqttc::QoS;
use std::time::Duration;

/// Notifications from the broker client, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionLost(String),
    MessageArrived(MqttMessage),
    /// Publish acknowledged by the broker, carries the packet id
    DeliveryComplete(u16),
    SubscribeAck {
        topic: String,
        result: Result<QoS, TransportError>,
    },
    UnsubscribeAck {
        topic: String,
    },
}

/// Broker client operations used by the connection supervisor
///
/// `subscribe`, `unsubscribe` and `publish` only report whether the request was
/// accepted. Broker acknowledgments arrive later as [`TransportEvent`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the connection, failing after `timeout` without a ConnAck
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Graceful disconnect, returns once the disconnect has been sent
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS)
        -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Releases the handle; every later call fails with [`TransportError::Closed`]
    async fn close(&self);
}
