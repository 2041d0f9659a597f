//! # MQTT Session Manager
//!
//! Keeps one broker connection alive and grows the subscription set as
//! gateways and drones announce themselves on the bootstrap topic.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs          - Broker settings, loaded from TOML
//! ├── error.rs           - Transport, session and config errors
//! ├── message_manager.rs - Inbound message representation
//! ├── transport.rs       - Transport trait and inbound events
//! ├── mqtt_handler.rs    - rumqttc transport and event pump
//! ├── retry.rs           - Connect-with-retry state machine
//! ├── supervisor.rs      - Connection lifecycle and broker requests
//! ├── registry.rs        - Discovered identities and their topic sets
//! ├── router.rs          - Inbound message classification
//! ├── session.rs         - Single-owner session task
//! └── session_handle.rs  - Caller facing command API
//! ```
//!
//! ## Data Flow
//!
//! 1. The supervisor connects with bounded exponential backoff
//! 2. On connect the bootstrap topic `device/info` is subscribed
//! 3. Announcements there record gateway and drone serials in the registry
//! 4. Each new serial subscribes its topic set through the supervisor
//!
//! Reconnecting after a lost connection is up to the caller.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod registry;
pub mod retry;
pub mod router;
pub mod session;
pub mod session_handle;
pub mod supervisor;
pub mod transport;

pub use config::{MqttConfig, MqttServer};
pub use error::{ConfigError, SessionError, TransportError};
pub use message_manager::MqttMessage;
pub use registry::{TopicRegistry, TopicSet, BOOTSTRAP_TOPIC, COMMAND_TOPIC};
pub use session::SessionStatus;
pub use session_handle::SessionHandle;
pub use supervisor::{Connection, ConnectionState, Dispatch, Rejection};
pub use transport::{Transport, TransportEvent};
