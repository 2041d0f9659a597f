//! Discovered gateway and drone identities and the topic sets derived from them
//!
//! The gateway identity is latest-write-wins, the drone identity is
//! first-write-wins. Both are cleared together once everything has been
//! unsubscribed.

use super::supervisor::ConnectionState;
use std::fmt;
use tracing::{debug, info};

/// Topic that announces gateways and drones
pub const BOOTSTRAP_TOPIC: &str = "device/info";
/// Topic the command line collaborator sends requests to
pub const COMMAND_TOPIC: &str = "device/command";

const SERIAL_PLACEHOLDER: &str = "{sn}";

const GATEWAY_TEMPLATES: [&str; 8] = [
    "thing/product/{sn}/osd",
    "thing/product/{sn}/state",
    "thing/product/{sn}/services_reply",
    "thing/product/{sn}/events",
    "thing/product/{sn}/requests",
    "sys/product/{sn}/status",
    "thing/product/{sn}/property/set_reply",
    "thing/product/{sn}/get_token",
];

const DRONE_TEMPLATES: [&str; 2] = ["thing/product/{sn}/osd", "thing/product/{sn}/state"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicFamily {
    Gateway,
    Drone,
}

impl fmt::Display for TopicFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TopicFamily::Gateway => write!(f, "gateway"),
            TopicFamily::Drone => write!(f, "drone"),
        }
    }
}

/// Ordered topics generated from one serial number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    family: TopicFamily,
    serial: String,
    topics: Vec<String>,
}

impl TopicSet {
    pub fn gateway(serial: &str) -> Self {
        Self::from_templates(TopicFamily::Gateway, serial, &GATEWAY_TEMPLATES)
    }

    pub fn drone(serial: &str) -> Self {
        Self::from_templates(TopicFamily::Drone, serial, &DRONE_TEMPLATES)
    }

    fn from_templates(family: TopicFamily, serial: &str, templates: &[&str]) -> Self {
        let topics = templates
            .iter()
            .map(|template| template.replace(SERIAL_PLACEHOLDER, serial))
            .collect();
        Self {
            family,
            serial: serial.to_string(),
            topics,
        }
    }

    pub fn family(&self) -> TopicFamily {
        self.family
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

fn is_blank(serial: &str) -> bool {
    serial.trim().is_empty()
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    gateway: Option<TopicSet>,
    drone: Option<TopicSet>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a gateway serial, replacing any earlier one
    ///
    /// Returns the topic set to request, or `None` for a blank serial.
    pub fn record_gateway_discovery(&mut self, serial: &str) -> Option<TopicSet> {
        if is_blank(serial) {
            debug!("Ignoring blank gateway serial");
            return None;
        }

        let topics = TopicSet::gateway(serial);
        if let Some(previous) = self.gateway.replace(topics.clone()) {
            if previous.serial() != serial {
                info!("Gateway changed from {} to {}", previous.serial(), serial);
            }
        } else {
            info!("Gateway discovered: {}", serial);
        }
        Some(topics)
    }

    /// Records the drone serial unless one is already known
    ///
    /// The serial is kept even while disconnected, but the topic set is only
    /// returned for subscription when `state` is `Connected`.
    pub fn record_drone_discovery(
        &mut self,
        serial: &str,
        state: ConnectionState,
    ) -> Option<TopicSet> {
        if is_blank(serial) {
            debug!("Ignoring blank drone serial");
            return None;
        }
        if let Some(existing) = &self.drone {
            debug!(
                "Drone {} already recorded, ignoring {}",
                existing.serial(),
                serial
            );
            return None;
        }

        let topics = TopicSet::drone(serial);
        self.drone = Some(topics.clone());
        info!("Drone discovered: {}", serial);

        if state == ConnectionState::Connected {
            Some(topics)
        } else {
            info!(
                "Not subscribing to drone topics for {} - connection is {:?}",
                serial, state
            );
            None
        }
    }

    /// Forgets both identities; unsubscribing is up to the caller
    pub fn clear(&mut self) {
        self.gateway = None;
        self.drone = None;
        debug!("Topic registry cleared");
    }

    pub fn gateway_serial(&self) -> Option<&str> {
        self.gateway.as_ref().map(TopicSet::serial)
    }

    pub fn drone_serial(&self) -> Option<&str> {
        self.drone.as_ref().map(TopicSet::serial)
    }

    pub fn gateway_topics(&self) -> Option<&TopicSet> {
        self.gateway.as_ref()
    }

    pub fn drone_topics(&self) -> Option<&TopicSet> {
        self.drone.as_ref()
    }

    pub fn has_drone(&self) -> bool {
        self.drone.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_topic_set_follows_templates() {
        let set = TopicSet::gateway("GW1");
        assert_eq!(set.family(), TopicFamily::Gateway);
        assert_eq!(
            set.topics(),
            [
                "thing/product/GW1/osd",
                "thing/product/GW1/state",
                "thing/product/GW1/services_reply",
                "thing/product/GW1/events",
                "thing/product/GW1/requests",
                "sys/product/GW1/status",
                "thing/product/GW1/property/set_reply",
                "thing/product/GW1/get_token",
            ]
        );
    }

    #[test]
    fn drone_topic_set_follows_templates() {
        let set = TopicSet::drone("DR1");
        assert_eq!(
            set.topics(),
            ["thing/product/DR1/osd", "thing/product/DR1/state"]
        );
    }

    #[test]
    fn gateway_is_latest_write_wins() {
        let mut registry = TopicRegistry::new();
        assert!(registry.record_gateway_discovery("GW1").is_some());
        let second = registry.record_gateway_discovery("GW2").unwrap();
        assert_eq!(second.serial(), "GW2");
        assert_eq!(registry.gateway_serial(), Some("GW2"));
        assert_eq!(
            registry.gateway_topics().unwrap().topics()[0],
            "thing/product/GW2/osd"
        );
    }

    #[test]
    fn drone_is_first_write_wins() {
        let mut registry = TopicRegistry::new();
        let first = registry.record_drone_discovery("DR1", ConnectionState::Connected);
        assert_eq!(first.map(|set| set.len()), Some(2));
        assert!(registry
            .record_drone_discovery("DR2", ConnectionState::Connected)
            .is_none());
        assert_eq!(registry.drone_serial(), Some("DR1"));
    }

    #[test]
    fn blank_serials_change_nothing() {
        let mut registry = TopicRegistry::new();
        for blank in ["", "   ", "\t"] {
            assert!(registry.record_gateway_discovery(blank).is_none());
            assert!(registry
                .record_drone_discovery(blank, ConnectionState::Connected)
                .is_none());
        }
        assert_eq!(registry.gateway_serial(), None);
        assert_eq!(registry.drone_serial(), None);

        registry.record_gateway_discovery("GW1");
        registry.record_gateway_discovery(" ");
        assert_eq!(registry.gateway_serial(), Some("GW1"));
    }

    #[test]
    fn drone_recorded_but_not_requested_while_disconnected() {
        let mut registry = TopicRegistry::new();
        assert!(registry
            .record_drone_discovery("DR1", ConnectionState::Disconnected)
            .is_none());
        assert_eq!(registry.drone_serial(), Some("DR1"));
        // Recorded already, so a later connected discovery does not request it either
        assert!(registry
            .record_drone_discovery("DR1", ConnectionState::Connected)
            .is_none());
    }

    #[test]
    fn clear_resets_both_identities() {
        let mut registry = TopicRegistry::new();
        registry.record_gateway_discovery("GW1");
        registry.record_drone_discovery("DR1", ConnectionState::Connected);
        registry.clear();
        assert_eq!(registry.gateway_serial(), None);
        assert_eq!(registry.drone_serial(), None);
        assert!(registry
            .record_drone_discovery("DR2", ConnectionState::Connected)
            .is_some());
    }
}
