//! NATS JetStream client: connect, publish, consume

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{Result, TxLogError};
use crate::types::{ProducerRecord, RecordMetadata};
use async_nats::jetstream;
use async_nats::jetstream::context::PublishErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Owns one connection and the stream every topic is bound to.
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: Mutex<jetstream::stream::Stream>,
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and make sure the stream exists
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            connect_opts.connect(&config.url),
        )
        .await
        .map_err(|_| TxLogError::ConnectionTimeout(config.url.clone()))?
        .map_err(|e| TxLogError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Publish each message of `record` and wait for its ack
    pub async fn publish(&self, record: &ProducerRecord) -> Result<Vec<RecordMetadata>> {
        let subject = self.config.subject(&record.topic);
        let mut metadata = Vec::with_capacity(record.messages.len());

        for message in &record.messages {
            let ack = self
                .jetstream
                .publish(subject.clone(), message.clone().into())
                .await
                .map_err(|e| publish_error(&record.topic, e.kind(), e.to_string()))?
                .await
                .map_err(|e| {
                    publish_error(&record.topic, e.kind(), format!("ack failed: {}", e))
                })?;

            metadata.push(RecordMetadata {
                topic: record.topic.clone(),
                partition: 0,
                offset: ack.sequence,
            });
        }

        tracing::debug!(
            subject = %subject,
            count = metadata.len(),
            "Messages published"
        );

        Ok(metadata)
    }

    /// Durable pull consumer over the given topics
    pub async fn subscribe(&self, topics: &[String]) -> Result<NatsSubscription> {
        let subjects: Vec<String> = topics.iter().map(|t| self.config.subject(t)).collect();
        let consumer_name = self.config.consumer_name.clone();

        let mut consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(consumer_name.clone()),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        };
        match subjects.as_slice() {
            [single] => consumer_config.filter_subject = single.clone(),
            _ => consumer_config.filter_subjects = subjects.clone(),
        }

        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(&consumer_name, consumer_config)
            .await
            .map_err(|e| TxLogError::Subscribe {
                topic: topics.join(","),
                reason: format!("consumer '{}': {}", consumer_name, e),
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| TxLogError::Subscribe {
                topic: topics.join(","),
                reason: e.to_string(),
            })?;

        tracing::info!(
            consumer = %consumer_name,
            subjects = ?subjects,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(messages, self.config.clone()))
    }

    /// Flush buffered publishes to the server
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TxLogError::Connection(format!("flush failed: {}", e)))
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Timeouts and dropped connections keep their transport meaning so the
/// producer can classify them
fn publish_error(topic: &str, kind: PublishErrorKind, reason: String) -> TxLogError {
    match kind {
        PublishErrorKind::TimedOut => {
            TxLogError::ConnectionTimeout(format!("publish to '{}': {}", topic, reason))
        }
        PublishErrorKind::BrokenPipe => {
            TxLogError::Connection(format!("publish to '{}': {}", topic, reason))
        }
        _ => TxLogError::Publish {
            topic: topic.to_string(),
            reason,
        },
    }
}

fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            TxLogError::Connection(format!(
                "Failed to create/get stream '{}': {}",
                config.stream_name, e
            ))
        })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureKind;

    #[test]
    fn test_publish_timeout_classifies_as_connection_timeout() {
        let err = publish_error("orders", PublishErrorKind::TimedOut, "timed out".into());
        assert!(matches!(err, TxLogError::ConnectionTimeout(_)));
        let kind = FailureKind::classify(&err.to_string());
        assert_eq!(kind, FailureKind::ConnectionTimeout);
        assert_eq!(kind.code(), "ret=4");
    }

    #[test]
    fn test_publish_broken_pipe_classifies_as_connection_error() {
        let err = publish_error("orders", PublishErrorKind::BrokenPipe, "broken pipe".into());
        assert!(matches!(err, TxLogError::Connection(_)));
        assert_eq!(FailureKind::classify(&err.to_string()).code(), "ret=1");
    }

    #[test]
    fn test_publish_stream_errors_stay_publish_errors() {
        let err = publish_error("orders", PublishErrorKind::StreamNotFound, "no stream".into());
        match err {
            TxLogError::Publish { topic, reason } => {
                assert_eq!(topic, "orders");
                assert_eq!(reason, "no stream");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
