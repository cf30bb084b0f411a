//! In-memory bus provider for tests and local development
//!
//! Records every published batch, counts producer connect/disconnect
//! cycles, and delivers injected messages to a single subscription.

use super::{BusProvider, PendingMessage, Subscription};
use crate::error::{Result, TxLogError};
use crate::types::{ProducerRecord, RawMessage, RecordMetadata};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    disconnects: AtomicU64,
    acks: AtomicU64,
}

#[derive(Default)]
struct State {
    sent: Vec<ProducerRecord>,
    offsets: HashMap<String, u64>,
    next_failure: Option<TxLogError>,
    connect_failure: Option<TxLogError>,
}

/// In-memory bus
pub struct MemoryProvider {
    counters: Arc<Counters>,
    connected: AtomicBool,
    state: Mutex<State>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<RawMessage>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<RawMessage>>>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            counters: Arc::new(Counters::default()),
            connected: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| TxLogError::Connection(format!("memory bus lock poisoned: {}", e)))
    }

    /// Make the next `send` fail with `err`
    pub fn fail_next_send(&self, err: TxLogError) {
        if let Ok(mut state) = self.state() {
            state.next_failure = Some(err);
        }
    }

    /// Make the next `connect` fail with `err`
    pub fn fail_next_connect(&self, err: TxLogError) {
        if let Ok(mut state) = self.state() {
            state.connect_failure = Some(err);
        }
    }

    /// Queue a message for the subscription
    pub fn inject(&self, message: RawMessage) -> Result<()> {
        let guard = self
            .inbound_tx
            .lock()
            .map_err(|e| TxLogError::Connection(format!("memory bus lock poisoned: {}", e)))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| TxLogError::Connection("memory bus inbound closed".to_string()))?;
        tx.send(message)
            .map_err(|_| TxLogError::Connection("memory bus subscription dropped".to_string()))
    }

    /// End the subscription stream once queued messages are drained
    pub fn close_inbound(&self) {
        if let Ok(mut tx) = self.inbound_tx.lock() {
            tx.take();
        }
    }

    /// Every batch published so far
    pub fn sent(&self) -> Vec<ProducerRecord> {
        self.state().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn connects(&self) -> u64 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u64 {
        self.counters.disconnects.load(Ordering::SeqCst)
    }

    /// Messages acknowledged by the consumer
    pub fn acks(&self) -> u64 {
        self.counters.acks.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusProvider for MemoryProvider {
    async fn connect(&self) -> Result<()> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state()?.connect_failure.take() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, record: &ProducerRecord) -> Result<Vec<RecordMetadata>> {
        let mut state = self.state()?;
        if let Some(err) = state.next_failure.take() {
            return Err(err);
        }
        if !self.is_connected() {
            return Err(TxLogError::NotInitialized("Memory producer connection".to_string()));
        }

        let offset = state.offsets.entry(record.topic.clone()).or_insert(0);
        let metadata = record
            .messages
            .iter()
            .map(|_| {
                let meta = RecordMetadata {
                    topic: record.topic.clone(),
                    partition: 0,
                    offset: *offset,
                };
                *offset += 1;
                meta
            })
            .collect();
        state.sent.push(record.clone());

        tracing::debug!(topic = %record.topic, count = record.messages.len(), "Memory bus publish");
        Ok(metadata)
    }

    async fn disconnect(&self) -> Result<()> {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>> {
        let rx = self
            .inbound_rx
            .lock()
            .map_err(|e| TxLogError::Connection(format!("memory bus lock poisoned: {}", e)))?
            .take()
            .ok_or_else(|| TxLogError::Subscribe {
                topic: topics.join(","),
                reason: "memory bus supports a single subscription".to_string(),
            })?;

        tracing::info!(topics = ?topics, "Memory bus subscription created");
        Ok(Box::new(MemorySubscription {
            rx,
            counters: self.counters.clone(),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription over injected messages; every message is delivered
/// regardless of topic
pub struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<RawMessage>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        let Some(message) = self.rx.recv().await else {
            return Ok(None);
        };
        let counters = self.counters.clone();
        Ok(Some(PendingMessage::new(
            message,
            move || {
                Box::pin(async move {
                    counters.acks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
            || Box::pin(async { Ok(()) }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, n: usize) -> ProducerRecord {
        ProducerRecord {
            topic: topic.to_string(),
            messages: (0..n).map(|i| format!("{{\"n\":{}}}", i)).collect(),
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let bus = MemoryProvider::new();
        let err = bus.send(&record("t", 1)).await.unwrap_err();
        assert!(matches!(err, TxLogError::NotInitialized(_)));

        bus.connect().await.unwrap();
        let meta = bus.send(&record("t", 2)).await.unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta[1].offset, 1);

        let meta = bus.send(&record("t", 1)).await.unwrap();
        assert_eq!(meta[0].offset, 2);

        bus.disconnect().await.unwrap();
        assert_eq!(bus.connects(), 1);
        assert_eq!(bus.disconnects(), 1);
        assert!(!bus.is_connected());
        assert_eq!(bus.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures_fire_once() {
        let bus = MemoryProvider::new();
        bus.fail_next_connect(TxLogError::ConnectionTimeout("broker".into()));
        assert!(bus.connect().await.is_err());
        bus.connect().await.unwrap();

        bus.fail_next_send(TxLogError::Connection("refused".into()));
        assert!(bus.send(&record("t", 1)).await.is_err());
        assert!(bus.send(&record("t", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_delivers_and_ends() {
        let bus = MemoryProvider::new();
        let mut sub = bus.subscribe(&["orders".to_string()]).await.unwrap();
        assert!(bus.subscribe(&["orders".to_string()]).await.is_err());

        bus.inject(RawMessage::new("orders", "{}")).unwrap();
        bus.close_inbound();

        let pending = sub.next().await.unwrap().unwrap();
        assert_eq!(pending.message().topic, "orders");
        pending.ack().await.unwrap();
        assert_eq!(bus.acks(), 1);

        assert!(sub.next().await.unwrap().is_none());
    }
}
