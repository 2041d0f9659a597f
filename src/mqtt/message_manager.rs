use chrono::NaiveDateTime;
use std::fmt;

const PREVIEW_CHARS: usize = 40;

/// An inbound message as handed to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    topic: String,
    content: String,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.timestamp, self.preview())
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, content: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            content: content.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Non UTF-8 payloads are decoded lossily, JSON parsing rejects them later
    pub fn from_payload(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::from_topic(topic, String::from_utf8_lossy(payload).into_owned())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// First characters of the content, for log lines
    pub fn preview(&self) -> String {
        let mut chars = self.content.chars();
        let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}
