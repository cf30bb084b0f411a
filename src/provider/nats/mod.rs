//! NATS JetStream bus provider
//!
//! Topics map to subjects `<prefix>.<topic>` on a single stream. The
//! producer connection is opened by `connect` and released by
//! `disconnect`; subscriptions hold their own connection.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType, CLIENT_ID_ENV, NATS_TOKEN_ENV, NATS_URL_ENV};
pub use subscriber::NatsSubscription;

use crate::error::{Result, TxLogError};
use crate::provider::{BusProvider, Subscription};
use crate::types::{ProducerRecord, RecordMetadata};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// NATS JetStream bus provider
pub struct NatsProvider {
    config: NatsConfig,
    producer: Mutex<Option<NatsClient>>,
}

impl NatsProvider {
    /// Provider for `config`; no connection is made until `connect`
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            producer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

#[async_trait]
impl BusProvider for NatsProvider {
    async fn connect(&self) -> Result<()> {
        let mut producer = self.producer.lock().await;
        if producer.is_none() {
            *producer = Some(NatsClient::connect(self.config.clone()).await?);
        }
        Ok(())
    }

    async fn send(&self, record: &ProducerRecord) -> Result<Vec<RecordMetadata>> {
        let producer = self.producer.lock().await;
        let client = producer
            .as_ref()
            .ok_or_else(|| TxLogError::NotInitialized("NATS producer".to_string()))?;
        client.publish(record).await
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self.producer.lock().await.take();
        if let Some(client) = client {
            client.flush().await?;
            tracing::debug!(url = %self.config.url, "NATS producer released");
        }
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>> {
        let client = NatsClient::connect(self.config.clone()).await?;
        let subscription = client.subscribe(topics).await?;
        Ok(Box::new(subscription))
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        Ok(NatsClient::connect(self.config.clone()).await.is_ok())
    }
}
