//! Session task: the single owner of supervisor, registry and router
//!
//! Every mutation happens inside [`Session::run`]. Callers talk to it through
//! [`SessionHandle`](super::session_handle::SessionHandle) commands; transport
//! notifications and retry progress arrive on their own channels, request
//! completions are joined from the supervisor. All are handled one at a time.
//!
//! ```text
//! SessionHandle ─[SessionCommand]─┐
//! Transport ───[TransportEvent]───┼──► Session::run ──► Supervisor ──► Transport
//! Retry loop ──[RetryEvent]───────┤          │
//! Request tasks [SupervisorEvent]─┘          ├──► MessageRouter
//!                                            └──► TopicRegistry
//! ```
//!
//! Closing first waits for every request already handed out, so an
//! `unsubscribe_all` followed by `close` reaches the broker before the
//! disconnect does.

use super::error::TransportError;
use super::registry::{TopicRegistry, TopicSet};
use super::retry::RetryEvent;
use super::router::{Discovery, MessageRouter};
use super::supervisor::{ConnectionState, Dispatch, Rejection, Supervisor, SupervisorEvent};
use super::transport::TransportEvent;
use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Snapshot of the session for callers and tests
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub retry_count: u32,
    pub gateway_serial: Option<String>,
    pub drone_serial: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub closed: bool,
}

#[derive(Debug)]
pub enum SessionCommand {
    ConnectWithRetry {
        response_tx: oneshot::Sender<()>,
    },
    Reconnect {
        response_tx: oneshot::Sender<()>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Close {
        response_tx: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Dispatch>,
    },
    Subscribe {
        topic: String,
        response_tx: oneshot::Sender<Dispatch>,
    },
    Unsubscribe {
        topic: String,
        response_tx: oneshot::Sender<Dispatch>,
    },
    UnsubscribeAll {
        response_tx: oneshot::Sender<Dispatch>,
    },
    Status {
        response_tx: oneshot::Sender<SessionStatus>,
    },
}

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Caller dropped the response channel");
        }
    };
}

pub struct Session {
    supervisor: Supervisor,
    registry: TopicRegistry,
    router: MessageRouter,
    messages_received: usize,
    messages_sent: usize,
    last_activity: Option<DateTime<Local>>,
    commands: mpsc::Receiver<SessionCommand>,
    transport_events: mpsc::Receiver<TransportEvent>,
    retry_events: mpsc::Receiver<RetryEvent>,
}

impl Session {
    pub fn new(
        supervisor: Supervisor,
        router: MessageRouter,
        commands: mpsc::Receiver<SessionCommand>,
        transport_events: mpsc::Receiver<TransportEvent>,
        retry_events: mpsc::Receiver<RetryEvent>,
    ) -> Self {
        Self {
            supervisor,
            registry: TopicRegistry::new(),
            router,
            messages_received: 0,
            messages_sent: 0,
            last_activity: None,
            commands,
            transport_events,
            retry_events,
        }
    }

    /// Runs until every handle has been dropped
    pub async fn run(mut self) {
        info!("Session task started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.retry_events.recv() => self.handle_retry_event(event),
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event),
                Some(joined) = self.supervisor.next_completion() => self.handle_completion(joined),
            }
        }

        if !self.supervisor.is_closed() {
            info!("All session handles dropped, closing client");
            self.close().await;
        }
        info!("Session task stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ConnectWithRetry { response_tx } => {
                self.supervisor.connect_with_retry();
                respond!(response_tx, ());
            }
            SessionCommand::Reconnect { response_tx } => {
                self.supervisor.reconnect();
                respond!(response_tx, ());
            }
            SessionCommand::Disconnect { response_tx } => {
                self.supervisor.disconnect().await;
                respond!(response_tx, ());
            }
            SessionCommand::Close { response_tx } => {
                self.close().await;
                respond!(response_tx, ());
            }
            SessionCommand::Publish {
                topic,
                payload,
                response_tx,
            } => {
                respond!(response_tx, self.supervisor.publish(&topic, payload));
            }
            SessionCommand::Subscribe { topic, response_tx } => {
                respond!(response_tx, self.supervisor.subscribe(&topic));
            }
            SessionCommand::Unsubscribe { topic, response_tx } => {
                respond!(response_tx, self.supervisor.unsubscribe(&topic));
            }
            SessionCommand::UnsubscribeAll { response_tx } => {
                respond!(response_tx, self.unsubscribe_all());
            }
            SessionCommand::Status { response_tx } => {
                respond!(response_tx, self.status());
            }
        }
    }

    /// Applies every outstanding request completion, then closes the supervisor
    async fn close(&mut self) {
        while let Some(joined) = self.supervisor.next_completion().await {
            self.handle_completion(joined);
        }
        self.supervisor.close().await;
    }

    fn status(&self) -> SessionStatus {
        let connection = self.supervisor.connection();
        SessionStatus {
            connection_state: connection.state,
            retry_count: connection.retry_count,
            gateway_serial: self.registry.gateway_serial().map(str::to_string),
            drone_serial: self.registry.drone_serial().map(str::to_string),
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            last_activity: self.last_activity,
            closed: self.supervisor.is_closed(),
        }
    }

    /// Unsubscribes bootstrap, gateway and drone topics, then forgets both serials
    fn unsubscribe_all(&mut self) -> Dispatch {
        if self.supervisor.is_closed() {
            warn!("Cannot unsubscribe - client is closed");
            return Dispatch::Rejected(Rejection::Closed);
        }
        if !self.supervisor.is_connected() {
            warn!("Cannot unsubscribe - not connected");
            return Dispatch::Rejected(Rejection::NotConnected);
        }

        let mut topics = vec![self.router.bootstrap_topic().to_string()];
        for set in [self.registry.gateway_topics(), self.registry.drone_topics()]
            .into_iter()
            .flatten()
        {
            topics.extend(set.topics().iter().cloned());
        }

        self.supervisor.unsubscribe_all(&topics);
        self.registry.clear();
        info!("Unsubscribed from all topics ({} requests)", topics.len());
        Dispatch::Requested
    }

    fn handle_retry_event(&mut self, event: RetryEvent) {
        if self.supervisor.on_retry_event(event) {
            self.on_connected();
        }
    }

    fn on_connected(&mut self) {
        let bootstrap = self.router.bootstrap_topic().to_string();
        if self.supervisor.subscribe(&bootstrap) == Dispatch::Requested {
            info!("Connected and subscribed to {}", bootstrap);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionLost(cause) => self.supervisor.on_connection_lost(&cause),
            TransportEvent::MessageArrived(message) => {
                self.messages_received += 1;
                self.last_activity = Some(Local::now());
                debug!("Message received: {} -> {}", message.topic(), message);
                for discovery in self.router.dispatch(&message, &self.registry) {
                    self.apply_discovery(discovery);
                }
            }
            TransportEvent::DeliveryComplete(pkid) => {
                debug!("Message delivered: packet {}", pkid);
            }
            TransportEvent::SubscribeAck { topic, result } => match result {
                Ok(qos) => info!("Subscribed to topic: {} ({:?})", topic, qos),
                Err(e) => self.on_subscribe_failure(&topic, &e),
            },
            TransportEvent::UnsubscribeAck { topic } => {
                info!("Unsubscribed from topic: {}", topic);
            }
        }
    }

    fn handle_completion(&mut self, joined: Result<Vec<SupervisorEvent>, JoinError>) {
        match joined {
            Ok(events) => {
                for event in events {
                    self.handle_supervisor_event(event);
                }
            }
            Err(e) if e.is_cancelled() => debug!("Request aborted on close"),
            Err(e) => error!("Request task failed: {}", e),
        }
    }

    fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::SubscribeRequested { topic, result } => match result {
                Ok(()) => debug!("Subscription to {} requested", topic),
                Err(e) => self.on_subscribe_failure(&topic, &e),
            },
            SupervisorEvent::UnsubscribeRequested { topic, result } => match result {
                Ok(()) => debug!("Unsubscription from {} requested", topic),
                Err(e) => error!("Failed to unsubscribe from {}: {}", topic, e),
            },
            SupervisorEvent::PublishRequested { topic, result } => match result {
                Ok(()) => {
                    self.messages_sent += 1;
                    self.last_activity = Some(Local::now());
                    info!("Published to {}", topic);
                }
                Err(e) => error!("Failed to publish to {}: {}", topic, e),
            },
        }
    }

    /// Only a not-connected failure triggers a reconnect
    fn on_subscribe_failure(&mut self, topic: &str, error: &TransportError) {
        error!("Failed to subscribe to {}: {}", topic, error);
        if *error == TransportError::NotConnected {
            self.supervisor.on_not_connected();
        }
    }

    fn apply_discovery(&mut self, discovery: Discovery) {
        let requested = match discovery {
            Discovery::Gateway(serial) => self.registry.record_gateway_discovery(&serial),
            Discovery::Drone(serial) => self
                .registry
                .record_drone_discovery(&serial, self.supervisor.state()),
        };
        if let Some(set) = requested {
            self.subscribe_set(&set);
        }
    }

    fn subscribe_set(&mut self, set: &TopicSet) {
        if set.is_empty() {
            return;
        }
        info!(
            "Subscribing to {} {} topics for {}",
            set.len(),
            set.family(),
            set.serial()
        );
        self.supervisor.subscribe_all(set.topics());
    }
}
