//! Session Handle - the caller facing API of the session manager
//!
//! Cheap to clone. Each method sends one command to the session task and waits
//! for its answer, so callers never observe half-applied state. Operations that
//! need a connection answer [`Dispatch::Rejected`] instead of failing.

use super::config::MqttConfig;
use super::error::SessionError;
use super::mqtt_handler::MqttTransport;
use super::router::MessageRouter;
use super::session::{Session, SessionCommand, SessionStatus};
use super::supervisor::{Connection, Dispatch, Supervisor};
use super::transport::{Transport, TransportEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Builds the rumqttc transport and starts the session task
    ///
    /// Must run inside a tokio runtime. Nothing connects until
    /// [`connect_with_retry`](Self::connect_with_retry).
    ///
    /// # Errors
    ///
    /// [`SessionError::InitializationError`] when the broker address or client
    /// id cannot be used to build the client.
    pub fn initialize(config: &MqttConfig) -> Result<(Self, JoinHandle<()>), SessionError> {
        let (events_tx, events_rx) = mpsc::channel(config.request_capacity.max(1));
        let transport = MqttTransport::new(config, events_tx)?;
        let connection = Connection::new(config.endpoint(), config.client_id.clone());
        Ok(Self::spawn(Arc::new(transport), events_rx, connection))
    }

    /// Starts a session task around any transport
    ///
    /// `transport_events` must be the receiving end of the channel the
    /// transport reports its notifications on.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        connection: Connection,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let (supervisor, retry_events) = Supervisor::new(transport, connection);
        let session = Session::new(
            supervisor,
            MessageRouter::default(),
            rx,
            transport_events,
            retry_events,
        );
        let task = tokio::spawn(session.run());
        info!("Session spawned");
        (Self { tx }, task)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(command(response_tx))
            .await
            .map_err(|e| SessionError::ChannelError(format!("Session task is gone: {}", e)))?;
        response_rx
            .await
            .map_err(|e| SessionError::ChannelError(format!("No response from session: {}", e)))
    }

    /// Starts the retry loop; no-op while connected or already retrying
    pub async fn connect_with_retry(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::ConnectWithRetry { response_tx })
            .await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::Reconnect { response_tx })
            .await
    }

    /// Returns after the graceful disconnect completed
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::Disconnect { response_tx })
            .await
    }

    /// Stops retrying, disconnects and releases the client; idempotent
    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::Close { response_tx })
            .await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Dispatch, SessionError> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|response_tx| SessionCommand::Publish {
            topic,
            payload,
            response_tx,
        })
        .await
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<Dispatch, SessionError> {
        let topic = topic.into();
        self.request(|response_tx| SessionCommand::Subscribe { topic, response_tx })
            .await
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<Dispatch, SessionError> {
        let topic = topic.into();
        self.request(|response_tx| SessionCommand::Unsubscribe { topic, response_tx })
            .await
    }

    pub async fn unsubscribe_all(&self) -> Result<Dispatch, SessionError> {
        self.request(|response_tx| SessionCommand::UnsubscribeAll { response_tx })
            .await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(|response_tx| SessionCommand::Status { response_tx })
            .await
    }
}
