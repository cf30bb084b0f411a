//! # a3s-txlog
//!
//! Cross-transport transaction correlation and audit logging for the A3S
//! ecosystem.
//!
//! ## Overview
//!
//! `a3s-txlog` threads one logical transaction through HTTP calls and bus
//! messages. Each transaction gets a session and an init invoke id, a
//! [`DetailLog`] recording every inbound and outbound call with masked
//! payloads, and a [`SummaryLog`] aggregating per-node outcomes. Both logs
//! are written as one JSON object per line to pluggable sinks.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_txlog::{AuditLogger, LogConfig, MessageDispatcher};
//! use a3s_txlog::provider::memory::MemoryProvider;
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_txlog::Result<()> {
//! let logger = AuditLogger::new(LogConfig::default().with_project_name("orders"))?;
//!
//! // Correlated loggers for an HTTP-triggered transaction
//! let mut logs = logger.common_log("create-order", Some("user-42"), None);
//! logs.summary_log.add_success_block("client", "create-order", "200", "ok");
//! logs.detail_log.end()?;
//! logs.summary_log.end("20000", "success")?;
//!
//! // Bus consumer
//! let dispatcher = MessageDispatcher::new(logger, Arc::new(MemoryProvider::new()));
//! println!("listening on {:?}", dispatcher.topics());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **id**: fixed-shape correlation identifiers
//! - **masking**: redaction of sensitive fields in nested JSON
//! - **log**: `AuditLogger` factory, `DetailLog`, `SummaryLog`, sinks
//! - **http**: outbound HTTP with 429 retry-after handling
//! - **dispatcher**: topic routing, per-message logs, producer
//! - **provider**: `BusProvider` trait with NATS JetStream and in-memory backends

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod id;
pub mod log;
pub mod masking;
pub mod provider;
pub mod schema;
pub mod types;

// Re-export core types
pub use config::{LogConfig, SinkConfig};
pub use dispatcher::{
    DispatchStatus, DispatcherStats, HandlerReply, MessageContext, MessageDispatcher,
    MessageHandler, Producer,
};
pub use error::{Result, TxLogError};
pub use http::{HttpResponse, HttpService, RequestAttributes};
pub use id::{generate_internal_tid, generate_xtid, nano_id};
pub use log::{AuditLogger, CommonLog, DetailLog, InboundRequest, LogSink, SummaryLog};
pub use masking::{Masker, MaskingRule, MaskingType};
pub use provider::{BusProvider, PendingMessage, Subscription};
pub use schema::{JsonType, ObjectSchema, TopicSchema, ValidationIssue, Validator};
pub use types::{
    FailureKind, Outcome, ProducerRecord, RawMessage, RecordMetadata, SendResult, CLIENT,
    KAFKA_CONSUMER, KAFKA_PRODUCER,
};

// Re-export providers for convenience
pub use provider::memory::MemoryProvider;
pub use provider::nats::{NatsClient, NatsConfig, NatsProvider, NatsSubscription, StorageType};
