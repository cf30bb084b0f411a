//! NATS JetStream bus configuration

use serde::{Deserialize, Serialize};

/// Environment variable for the server URL
pub const NATS_URL_ENV: &str = "NATS_URL";
/// Environment variable for the auth token
pub const NATS_TOKEN_ENV: &str = "NATS_TOKEN";
/// Environment variable for the durable consumer name
pub const CLIENT_ID_ENV: &str = "BUS_CLIENT_ID";

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// NATS connection and stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL (e.g., "nats://127.0.0.1:4222")
    pub url: String,

    /// JetStream stream holding every topic
    pub stream_name: String,

    /// Subject prefix; topic `orders` maps to `<prefix>.orders`
    pub subject_prefix: String,

    /// Durable consumer name shared by this service's instances
    pub consumer_name: String,

    pub storage: StorageType,

    /// Stream limits; zero or negative means unlimited
    pub max_events: i64,
    pub max_age_secs: u64,
    pub max_bytes: i64,

    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "TXLOG".to_string(),
            subject_prefix: "bus".to_string(),
            consumer_name: format!("{}-consumer", env!("CARGO_PKG_NAME")),
            storage: StorageType::File,
            max_events: 100_000,
            max_age_secs: 7 * 24 * 3600,
            max_bytes: -1,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            token: None,
        }
    }
}

impl NatsConfig {
    /// Defaults overridden by `NATS_URL`, `NATS_TOKEN` and `BUS_CLIENT_ID`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(NATS_URL_ENV) {
            config.url = url;
        }
        if let Ok(token) = std::env::var(NATS_TOKEN_ENV) {
            config.token = Some(token);
        }
        if let Ok(client_id) = std::env::var(CLIENT_ID_ENV) {
            config.consumer_name = client_id;
        }
        config
    }

    /// Subject for a topic
    pub fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, topic)
    }

    /// Topic for a subject, if it carries this config's prefix
    pub fn topic<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
    }

    /// Subjects bound to the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }
}
