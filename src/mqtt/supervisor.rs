//! Connection supervisor
//!
//! Owns the transport handle and the connection record. All state changes
//! happen on the session task; connect attempts and broker requests run in
//! spawned tasks. Request tasks are kept in a [`JoinSet`] and their
//! [`SupervisorEvent`]s are collected through [`Supervisor::next_completion`].
//!
//! ```text
//! Disconnected ──connect_with_retry──► Connecting ──connected──► Connected
//!      ▲                                                            │
//!      └──────────────── connection lost / disconnect ──────────────┘
//! ```

use super::error::TransportError;
use super::retry::{spawn_retry_loop, RetryEvent};
use super::transport::Transport;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// The one broker connection of this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub endpoint: String,
    pub client_id: String,
    pub state: ConnectionState,
    /// Failed attempts of the current retry loop
    pub retry_count: u32,
}

impl Connection {
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            state: ConnectionState::Disconnected,
            retry_count: 0,
        }
    }
}

/// Whether an operation was handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Requested,
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotConnected,
    Closed,
}

/// Completions of broker requests, one per topic
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    SubscribeRequested {
        topic: String,
        result: Result<(), TransportError>,
    },
    UnsubscribeRequested {
        topic: String,
        result: Result<(), TransportError>,
    },
    PublishRequested {
        topic: String,
        result: Result<(), TransportError>,
    },
}

pub struct Supervisor {
    connection: Connection,
    transport: Option<Arc<dyn Transport>>,
    shutdown: CancellationToken,
    /// Set from launch until the loop's `Connected` event is applied or close
    retry_task: Option<JoinHandle<()>>,
    requests: JoinSet<Vec<SupervisorEvent>>,
    retry_events: mpsc::Sender<RetryEvent>,
}

impl Supervisor {
    /// Creates the supervisor around an already constructed transport
    ///
    /// Returns the receiver for retry loop progress.
    pub fn new(
        transport: Arc<dyn Transport>,
        connection: Connection,
    ) -> (Self, mpsc::Receiver<RetryEvent>) {
        let (retry_events, retry_rx) = mpsc::channel(16);
        info!(
            "Supervisor ready for {} as {}",
            connection.endpoint, connection.client_id
        );
        (
            Self {
                connection,
                transport: Some(transport),
                shutdown: CancellationToken::new(),
                retry_task: None,
                requests: JoinSet::new(),
                retry_events,
            },
            retry_rx,
        )
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// A finished loop still counts until its result has been applied
    fn retry_active(&self) -> bool {
        self.retry_task.is_some()
    }

    /// Launches the retry loop unless one is running or the link is up
    pub fn connect_with_retry(&mut self) {
        let Some(transport) = self.transport.clone() else {
            warn!("Cannot connect - client is closed");
            return;
        };
        if self.is_connected() {
            debug!("Already connected, not starting a retry loop");
            return;
        }
        if self.retry_active() {
            debug!("Retry loop already active");
            return;
        }

        info!("Connecting to MQTT broker {}", self.connection.endpoint);
        self.connection.state = ConnectionState::Connecting;
        self.connection.retry_count = 0;
        self.retry_task = Some(spawn_retry_loop(
            transport,
            self.shutdown.child_token(),
            self.retry_events.clone(),
        ));
    }

    /// Restarts the retry loop when not connected
    pub fn reconnect(&mut self) {
        if self.is_connected() {
            debug!("Reconnect requested while connected, ignoring");
            return;
        }
        info!("Reconnecting to MQTT broker...");
        self.connect_with_retry();
    }

    /// Applies retry loop progress, returns true when the link just came up
    pub fn on_retry_event(&mut self, event: RetryEvent) -> bool {
        if self.is_closed() {
            debug!("Ignoring retry event after close: {:?}", event);
            return false;
        }
        match event {
            RetryEvent::Connected { retries } => {
                self.retry_task = None;
                self.connection.retry_count = retries;
                self.connection.state = ConnectionState::Connected;
                info!("Connected to {}", self.connection.endpoint);
                true
            }
            RetryEvent::AttemptFailed { retry_count, delay } => {
                self.connection.retry_count = retry_count;
                debug!(
                    "Attempt {} failed, next attempt in {}s",
                    retry_count,
                    delay.as_secs()
                );
                false
            }
        }
    }

    /// Marks the link as down, reconnecting is left to the caller
    pub fn on_connection_lost(&mut self, cause: &str) {
        self.connection.state = ConnectionState::Disconnected;
        warn!("Connection lost: {}", cause);
    }

    /// A request failed because the client is not connected
    pub fn on_not_connected(&mut self) {
        if self.is_connected() {
            warn!("Transport reports not connected, marking connection as down");
            self.connection.state = ConnectionState::Disconnected;
        }
        self.reconnect();
    }

    /// Graceful disconnect, errors are logged only
    pub async fn disconnect(&mut self) {
        if !self.is_connected() {
            debug!("Disconnect requested while not connected, ignoring");
            return;
        }
        if let Some(transport) = &self.transport {
            match transport.disconnect().await {
                Ok(()) => info!("Disconnected from MQTT broker"),
                Err(e) => error!("Error while disconnecting: {}", e),
            }
        }
        self.connection.state = ConnectionState::Disconnected;
    }

    /// Waits for the next finished request task
    ///
    /// Resolves to `None` at once while no request is in flight.
    pub async fn next_completion(&mut self) -> Option<Result<Vec<SupervisorEvent>, JoinError>> {
        self.requests.join_next().await
    }

    /// Cancels any retry loop, disconnects and releases the transport
    ///
    /// Requests still in flight must be drained with
    /// [`next_completion`](Self::next_completion) beforehand, otherwise they
    /// are aborted here.
    pub async fn close(&mut self) {
        let Some(transport) = self.transport.clone() else {
            debug!("Client already closed");
            return;
        };

        self.shutdown.cancel();
        if let Some(task) = self.retry_task.take() {
            if let Err(e) = task.await {
                warn!("Retry loop ended abnormally: {}", e);
            }
        }
        if !self.requests.is_empty() {
            warn!("Aborting {} unfinished requests", self.requests.len());
            self.requests.abort_all();
        }

        self.disconnect().await;
        transport.close().await;
        self.transport = None;
        self.connection.state = ConnectionState::Disconnected;
        info!("MQTT client closed");
    }

    fn usable_transport(&self, operation: &str, topic: &str) -> Result<Arc<dyn Transport>, Rejection> {
        let Some(transport) = self.transport.clone() else {
            warn!("Cannot {} {} - client is closed", operation, topic);
            return Err(Rejection::Closed);
        };
        if !self.is_connected() {
            warn!("Cannot {} {} - not connected", operation, topic);
            return Err(Rejection::NotConnected);
        }
        Ok(transport)
    }

    /// Requests a QoS 1 subscription
    pub fn subscribe(&mut self, topic: &str) -> Dispatch {
        self.subscribe_all(&[topic.to_string()])
    }

    /// Requests QoS 1 subscriptions for `topics`, one after another in order
    pub fn subscribe_all(&mut self, topics: &[String]) -> Dispatch {
        let transport = match self.usable_transport("subscribe to", &topics.join(", ")) {
            Ok(transport) => transport,
            Err(rejection) => return Dispatch::Rejected(rejection),
        };
        let topics = topics.to_vec();
        self.requests.spawn(async move {
            let mut completions = Vec::with_capacity(topics.len());
            for topic in topics {
                let result = transport.subscribe(&topic, QoS::AtLeastOnce).await;
                completions.push(SupervisorEvent::SubscribeRequested { topic, result });
            }
            completions
        });
        Dispatch::Requested
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Dispatch {
        self.unsubscribe_all(&[topic.to_string()])
    }

    /// Requests unsubscription from `topics`, one after another in order
    pub fn unsubscribe_all(&mut self, topics: &[String]) -> Dispatch {
        let transport = match self.usable_transport("unsubscribe from", &topics.join(", ")) {
            Ok(transport) => transport,
            Err(rejection) => return Dispatch::Rejected(rejection),
        };
        let topics = topics.to_vec();
        self.requests.spawn(async move {
            let mut completions = Vec::with_capacity(topics.len());
            for topic in topics {
                let result = transport.unsubscribe(&topic).await;
                completions.push(SupervisorEvent::UnsubscribeRequested { topic, result });
            }
            completions
        });
        Dispatch::Requested
    }

    /// Publishes with at-least-once delivery
    pub fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Dispatch {
        let transport = match self.usable_transport("publish to", topic) {
            Ok(transport) => transport,
            Err(rejection) => return Dispatch::Rejected(rejection),
        };
        let topic = topic.to_string();
        self.requests.spawn(async move {
            let result = transport.publish(&topic, payload, QoS::AtLeastOnce).await;
            vec![SupervisorEvent::PublishRequested { topic, result }]
        });
        Dispatch::Requested
    }
}
