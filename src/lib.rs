//! cloudlink - resilient MQTT session manager for gateway and drone telemetry

pub mod mqtt;
