//! Core message and result types
//!
//! Bus messages, producer records, and the closed `Outcome` vocabulary the
//! producer and HTTP client report with. Result payloads use snake_case
//! field names for wire compatibility with existing consumers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node name for messages this service produces
pub const KAFKA_PRODUCER: &str = "kafka_producer";

/// Node name for messages this service consumes
pub const KAFKA_CONSUMER: &str = "kafka_consumer";

/// Node name for inbound HTTP clients
pub const CLIENT: &str = "client";

/// A message as delivered by a bus backend, before normalization
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub headers: Vec<(String, Bytes)>,
    pub value: Option<Bytes>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            headers: Vec::new(),
            value: Some(value.into()),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Decode header buffers and the value to strings and parse the body
    pub fn normalize(&self) -> InboundMessage {
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect();
        let value = self
            .value
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).into_owned());
        let envelope = Envelope::parse(value.as_deref());

        InboundMessage {
            topic: self.topic.clone(),
            partition: self.partition,
            headers,
            value,
            envelope,
        }
    }
}

/// A bus message with string headers and a parsed body
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub headers: HashMap<String, String>,
    pub value: Option<String>,
    pub envelope: Envelope,
}

/// `{header, body}` view of a message value.
///
/// Values that are JSON objects carrying a `header` or `body` key are split
/// into those parts. Any other JSON is the body; non-JSON text is a string
/// body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub header: Option<serde_json::Value>,
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn parse(value: Option<&str>) -> Self {
        let Some(raw) = value else {
            return Self::default();
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(mut map))
                if map.contains_key("header") || map.contains_key("body") =>
            {
                Self {
                    header: map.remove("header").filter(|h| !h.is_null()),
                    body: map.remove("body").unwrap_or(serde_json::Value::Null),
                }
            }
            Ok(parsed) => Self {
                header: None,
                body: parsed,
            },
            Err(_) => Self {
                header: None,
                body: serde_json::Value::String(raw.to_string()),
            },
        }
    }

    /// Session carried in `header.session`, if any
    pub fn session(&self) -> Option<&str> {
        self.header
            .as_ref()
            .and_then(|h| h.get("session"))
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Messages to publish on one topic
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub messages: Vec<String>,
}

/// Broker acknowledgement for a published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
}

/// Transport failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Message mentions `Connection timeout`
    ConnectionTimeout,
    /// Message mentions `Connection error`
    ConnectionError,
    /// Anything unrecognized
    System,
    /// Producer or client was never set up
    NotInitialized,
    /// A fallback path returned a placeholder result
    Degraded,
}

impl FailureKind {
    /// Classify by substring of an error message
    pub fn classify(message: &str) -> Self {
        if message.contains("Connection timeout") {
            Self::ConnectionTimeout
        } else if message.contains("Connection error") {
            Self::ConnectionError
        } else {
            Self::System
        }
    }

    /// Summary block result code
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "ret=4",
            Self::ConnectionError => "ret=1",
            Self::System | Self::NotInitialized | Self::Degraded => "",
        }
    }

    /// Summary block description
    pub fn description(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "Connection timeout",
            Self::ConnectionError => "Connection error",
            Self::System => "system error",
            Self::NotInitialized => "not initialized",
            Self::Degraded => "degraded",
        }
    }
}

/// Result of a producer or client call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok { data: T },
    Err { kind: FailureKind, desc: String },
}

impl<T> Outcome<T> {
    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err { .. })
    }

    /// `"Success"` or the failure description
    pub fn result_desc(&self) -> &str {
        match self {
            Self::Ok { .. } => "Success",
            Self::Err { desc, .. } => desc,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Ok { data } => Some(data),
            Self::Err { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            Self::Ok { .. } => None,
            Self::Err { kind, .. } => Some(*kind),
        }
    }
}

impl<T: Serialize> Outcome<T> {
    /// `{err, result_desc, result_data}` payload handed back to handlers
    pub fn to_send_result(&self) -> SendResult {
        let result_data = match self {
            Self::Ok { data } => serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            Self::Err { .. } => serde_json::Value::Array(Vec::new()),
        };
        SendResult {
            err: self.is_err(),
            result_desc: self.result_desc().to_string(),
            result_data,
        }
    }
}

/// Wire shape of a publish result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub err: bool,
    pub result_desc: String,
    pub result_data: serde_json::Value,
}
