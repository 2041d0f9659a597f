//! Classification of inbound messages
//!
//! Rules are checked in a fixed order and only the first match applies:
//!
//! ```text
//! topic == bootstrap topic         ──► parse announcement ──► discoveries
//! topic contains gateway serial    ──► gateway status
//! topic contains drone serial      ──► drone status
//! anything else                    ──► unclassified
//! ```

use super::message_manager::MqttMessage;
use super::registry::{TopicRegistry, BOOTSTRAP_TOPIC};
use serde::Deserialize;
use tracing::{debug, info, warn};

const GATEWAY_INFO: &str = "gateway_info";
const DRONE_INFO: &str = "drone_info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Bootstrap,
    GatewayStatus,
    DroneStatus,
    Unclassified,
}

/// Serial number announced on the bootstrap topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Gateway(String),
    Drone(String),
}

/// `{"method": ..., "data": {"gateway_sn": ..., "drone_sn": ...}}`
#[derive(Debug, Default, Deserialize)]
pub struct BootstrapMessage {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub data: Option<DeviceInfo>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub gateway_sn: Option<String>,
    #[serde(default)]
    pub drone_sn: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .filter(|serial| !serial.trim().is_empty())
}

impl BootstrapMessage {
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Serials this announcement reports
    ///
    /// For `gateway_info` the gateway and drone serials are extracted
    /// independently. Drone serials are skipped once a drone is known.
    pub fn discoveries(&self, drone_known: bool) -> Vec<Discovery> {
        let mut discoveries = Vec::new();
        let Some(data) = &self.data else {
            debug!("Announcement without data object, ignoring");
            return discoveries;
        };

        match self.method.as_deref() {
            Some(GATEWAY_INFO) => {
                if let Some(serial) = non_blank(&data.gateway_sn) {
                    discoveries.push(Discovery::Gateway(serial.to_string()));
                }
                if !drone_known {
                    if let Some(serial) = non_blank(&data.drone_sn) {
                        discoveries.push(Discovery::Drone(serial.to_string()));
                    }
                }
            }
            Some(DRONE_INFO) => {
                if !drone_known {
                    if let Some(serial) = non_blank(&data.drone_sn) {
                        discoveries.push(Discovery::Drone(serial.to_string()));
                    }
                }
            }
            Some(other) => debug!("Ignoring announcement with method {}", other),
            None => debug!("Ignoring announcement without method"),
        }
        discoveries
    }
}

#[derive(Debug, Clone)]
pub struct MessageRouter {
    bootstrap_topic: String,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(BOOTSTRAP_TOPIC)
    }
}

impl MessageRouter {
    pub fn new(bootstrap_topic: impl Into<String>) -> Self {
        Self {
            bootstrap_topic: bootstrap_topic.into(),
        }
    }

    pub fn bootstrap_topic(&self) -> &str {
        &self.bootstrap_topic
    }

    /// Serial substring checks only apply once that serial has been recorded
    pub fn classify(&self, topic: &str, registry: &TopicRegistry) -> Route {
        if topic == self.bootstrap_topic {
            return Route::Bootstrap;
        }
        if registry
            .gateway_serial()
            .is_some_and(|serial| topic.contains(serial))
        {
            return Route::GatewayStatus;
        }
        if registry
            .drone_serial()
            .is_some_and(|serial| topic.contains(serial))
        {
            return Route::DroneStatus;
        }
        Route::Unclassified
    }

    /// Classifies and handles one message, returning the discoveries to record
    ///
    /// Parse failures are logged and the message is dropped.
    pub fn dispatch(&self, message: &MqttMessage, registry: &TopicRegistry) -> Vec<Discovery> {
        match self.classify(message.topic(), registry) {
            Route::Bootstrap => match BootstrapMessage::parse(message.content()) {
                Ok(announcement) => announcement.discoveries(registry.has_drone()),
                Err(e) => {
                    warn!(
                        "Dropping malformed message on {}: {} ({})",
                        message.topic(),
                        e,
                        message.preview()
                    );
                    Vec::new()
                }
            },
            Route::GatewayStatus => {
                info!(
                    "Received gateway message on topic {}: {}",
                    message.topic(),
                    message.preview()
                );
                Vec::new()
            }
            Route::DroneStatus => {
                info!(
                    "Received drone message on topic {}: {}",
                    message.topic(),
                    message.preview()
                );
                Vec::new()
            }
            Route::Unclassified => {
                info!(
                    "Received other message on topic {}: {}",
                    message.topic(),
                    message.preview()
                );
                Vec::new()
            }
        }
    }
}
