//! Bus provider trait, the seam between the dispatcher and a message bus
//!
//! Backends (NATS JetStream, in-memory) implement `BusProvider` for the
//! producer side and hand out `Subscription`s for the consumer side. The
//! provider is an explicitly owned object injected into the dispatcher.

use crate::error::Result;
use crate::types::{ProducerRecord, RawMessage, RecordMetadata};
use async_trait::async_trait;
use futures::future::BoxFuture;

pub mod memory;
pub mod nats;

/// Core trait for bus backends.
///
/// The producer path calls `connect`, `send`, then `disconnect` for every
/// publish; implementations must tolerate repeated cycles.
#[async_trait]
pub trait BusProvider: Send + Sync {
    /// Open the producer connection
    async fn connect(&self) -> Result<()>;

    /// Publish every message in `record`, one metadata entry per message
    async fn send(&self, record: &ProducerRecord) -> Result<Vec<RecordMetadata>>;

    /// Close the producer connection
    async fn disconnect(&self) -> Result<()>;

    /// Start consuming `topics`
    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check; default assumes healthy
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Async subscription handle for receiving messages
#[async_trait]
pub trait Subscription: Send {
    /// Next message awaiting acknowledgement; `None` when the stream ends
    async fn next(&mut self) -> Result<Option<PendingMessage>>;
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A message pending acknowledgement
pub struct PendingMessage {
    message: RawMessage,
    ack_fn: AckFn,
    nak_fn: AckFn,
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("topic", &self.message.topic)
            .field("partition", &self.message.partition)
            .finish()
    }
}

impl PendingMessage {
    /// Create a pending message with ack/nak callbacks
    pub fn new(
        message: RawMessage,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            message,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Message whose ack and nak do nothing
    pub fn unacked(message: RawMessage) -> Self {
        Self::new(
            message,
            || Box::pin(async { Ok(()) }),
            || Box::pin(async { Ok(()) }),
        )
    }

    pub fn message(&self) -> &RawMessage {
        &self.message
    }

    /// Acknowledge processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Request redelivery
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }
}
