use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BridgeError;

/// Delivery guarantee negotiated per subscription or publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// QoS 0 - at most once
    #[default]
    AtMostOnce,
    /// QoS 1 - at least once
    AtLeastOnce,
}

impl TryFrom<u8> for Qos {
    type Error = BridgeError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            other => Err(BridgeError::InvalidQos(other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

impl From<rumqttc::QoS> for Qos {
    /// QoS 2 deliveries are treated as QoS 1; exactly-once is not offered here.
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Qos::AtMostOnce,
            _ => Qos::AtLeastOnce,
        }
    }
}

/// Message body
///
/// Outbound payloads may be raw bytes, text or a JSON value; JSON objects and
/// arrays go on the wire in their serialized form and scalars as their textual
/// rendering. Inbound payloads are `Text` when the bytes are valid UTF-8 and
/// `Binary` otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn from_wire(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Binary(bytes.to_vec()),
        }
    }

    /// Wire representation of the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Binary(bytes) => bytes.clone(),
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Json(serde_json::Value::String(text)) => text.as_bytes().to_vec(),
            Payload::Json(value) => value.to_string().into_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(bytes.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Text(value.to_string())
    }
}

/// Outbound message handed to the connection manager
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Payload,
    pub qos: Qos,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Message {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Message delivered by the broker to matching listeners
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Payload,
    pub qos: Qos,
    pub retain: bool,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn from_wire(topic: impl Into<String>, bytes: &[u8], qos: Qos, retain: bool) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: Payload::from_wire(bytes),
            qos,
            retain,
            received_at: Local::now(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.received_at.naive_local(), self.topic, self)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.payload {
            Payload::Text(text) => {
                let preview: String = text.chars().take(64).collect();
                write!(f, "{}", preview)
            }
            Payload::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Payload::Json(value) => write!(f, "{}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qos_levels() {
        assert_eq!(Qos::try_from(0).unwrap(), Qos::AtMostOnce);
        assert_eq!(Qos::try_from(1).unwrap(), Qos::AtLeastOnce);
        assert!(matches!(Qos::try_from(2), Err(BridgeError::InvalidQos(2))));
        assert!(Qos::AtLeastOnce > Qos::AtMostOnce);
        assert_eq!(Qos::from(rumqttc::QoS::ExactlyOnce), Qos::AtLeastOnce);
    }

    #[test]
    fn inbound_payload_is_text_only_when_utf8() {
        assert_eq!(Payload::from_wire(b"hello"), Payload::Text("hello".into()));
        assert_eq!(
            Payload::from_wire(&[0xff, 0xfe, 0x00]),
            Payload::Binary(vec![0xff, 0xfe, 0x00])
        );
    }

    #[test]
    fn outbound_normalization() {
        assert_eq!(Payload::from(vec![1u8, 2, 3]).to_bytes(), vec![1, 2, 3]);
        assert_eq!(Payload::from("text").to_bytes(), b"text".to_vec());
        assert_eq!(
            Payload::from(json!({"temp": 21})).to_bytes(),
            br#"{"temp":21}"#.to_vec()
        );
        assert_eq!(Payload::from(json!([1, 2])).to_bytes(), b"[1,2]".to_vec());
        assert_eq!(Payload::from(json!("plain")).to_bytes(), b"plain".to_vec());
        assert_eq!(Payload::from(42i64).to_bytes(), b"42".to_vec());
        assert_eq!(Payload::from(true).to_bytes(), b"true".to_vec());
        assert_eq!(Payload::from(json!(null)).to_bytes(), b"null".to_vec());
    }

    #[test]
    fn display_truncates_long_text() {
        let long = "x".repeat(200);
        let message = InboundMessage::from_wire("a/b", long.as_bytes(), Qos::AtMostOnce, false);
        assert_eq!(message.to_string().len(), 64);

        let short = InboundMessage::from_wire("a/b", b"hi", Qos::AtMostOnce, false);
        assert_eq!(short.to_string(), "hi");
    }
}
