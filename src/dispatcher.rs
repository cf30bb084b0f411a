//! Bus message dispatch and publishing
//!
//! [`MessageDispatcher`] routes inbound messages to the handler registered
//! for their topic, opens a correlated log pair per message and guarantees
//! both logs are closed exactly once whatever the handler does. The
//! [`Producer`] publishes with a connect/send/disconnect cycle per call and
//! records every publish in the caller's logs.

use crate::error::{Result, TxLogError};
use crate::id::{generate_internal_tid, generate_xtid};
use crate::log::{AuditLogger, CommonLog, DetailLog, SummaryLog};
use crate::provider::{BusProvider, Subscription};
use crate::schema::TopicSchema;
use crate::types::{
    Envelope, FailureKind, InboundMessage, Outcome, ProducerRecord, RawMessage, RecordMetadata,
    SendResult, KAFKA_CONSUMER, KAFKA_PRODUCER,
};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Length of the invoke id minted for each publish
const PUBLISH_INVOKE_LEN: i64 = 20;

/// Summary code for a successful publish
const PUBLISH_SUCCESS_CODE: &str = "20000";

/// Upper bound on the pause after repeated subscription errors
const MAX_STREAM_BACKOFF: Duration = Duration::from_secs(5);

/// Publishes records and logs them against a transaction
pub struct Producer {
    bus: Option<Arc<dyn BusProvider>>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("bus", &self.bus.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl Producer {
    pub fn new(bus: Arc<dyn BusProvider>) -> Self {
        Self { bus: Some(bus) }
    }

    /// Producer with no bus; every publish fails with `NotInitialized`
    pub fn uninitialized() -> Self {
        Self { bus: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.bus.is_some()
    }

    /// Publish `payload` to `topic`.
    ///
    /// Arrays are sent as one message per element. The producer connection
    /// is opened for this call and always released afterwards. Failures are
    /// classified by message text and returned, never raised.
    pub async fn produce_message(
        &self,
        topic: &str,
        payload: &Value,
        detail: &mut DetailLog,
        summary: &mut SummaryLog,
    ) -> Outcome<Vec<RecordMetadata>> {
        let Some(bus) = &self.bus else {
            tracing::warn!(topic = topic, "Publish attempted without a producer");
            return Outcome::Err {
                kind: FailureKind::NotInitialized,
                desc: "Producer not initialized".to_string(),
            };
        };

        let record = ProducerRecord {
            topic: topic.to_string(),
            messages: serialize_payload(payload),
        };
        let invoke = generate_internal_tid("kafka", "-", PUBLISH_INVOKE_LEN);
        let raw = json!({ "topic": topic, "messages": record.messages }).to_string();
        detail.add_output_request(
            KAFKA_PRODUCER,
            topic,
            &invoke,
            &raw,
            payload.clone(),
            Some("kafka"),
            None,
        );

        let sent = match bus.connect().await {
            Ok(()) => bus.send(&record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = bus.disconnect().await {
            tracing::warn!(topic = topic, error = %e, "Producer disconnect failed");
        }

        match sent {
            Ok(metadata) => {
                let data = json!({ "Return": metadata });
                detail.add_input_response(KAFKA_PRODUCER, topic, &invoke, &data.to_string(), data, None);
                summary.add_success_block(KAFKA_PRODUCER, topic, PUBLISH_SUCCESS_CODE, "success");
                tracing::debug!(topic = topic, count = metadata.len(), "Message published");
                Outcome::Ok { data: metadata }
            }
            Err(e) => {
                let message = e.to_string();
                let kind = FailureKind::classify(&message);
                summary
                    .add_field("errorCause", message.clone())
                    .add_error_block(KAFKA_PRODUCER, topic, kind.code(), kind.description());
                detail.add_input_response_error(KAFKA_PRODUCER, topic, &invoke, Some(&message));
                tracing::warn!(
                    topic = topic,
                    kind = ?kind,
                    error = %message,
                    "Publish failed"
                );
                Outcome::Err {
                    kind,
                    desc: failure_desc(kind, message),
                }
            }
        }
    }
}

/// Caller-facing description: the bare transport condition for classified
/// failures, the full error text otherwise
fn failure_desc(kind: FailureKind, message: String) -> String {
    match kind {
        FailureKind::ConnectionTimeout | FailureKind::ConnectionError => {
            kind.description().to_string()
        }
        _ => message,
    }
}

/// Wire messages for a payload: one per array element, objects as JSON,
/// strings verbatim
fn serialize_payload(payload: &Value) -> Vec<String> {
    match payload {
        Value::Array(items) => items.iter().map(serialize_one).collect(),
        other => vec![serialize_one(other)],
    }
}

fn serialize_one(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What a handler returns on success
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerReply {
    /// Recorded as the message's output event
    pub data: Value,
    /// Follow-up message published before the logs close
    pub publish: Option<(String, Value)>,
}

impl HandlerReply {
    pub fn new(data: Value) -> Self {
        Self { data, publish: None }
    }

    /// Also publish `payload` to `topic`
    pub fn publish_to(mut self, topic: impl Into<String>, payload: Value) -> Self {
        self.publish = Some((topic.into(), payload));
        self
    }
}

/// Business logic for one topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &mut MessageContext) -> Result<HandlerReply>;
}

/// Per-message state handed to a [`MessageHandler`]
pub struct MessageContext {
    message: InboundMessage,
    logger: AuditLogger,
    producer: Arc<Producer>,
    logs: Option<CommonLog>,
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("topic", &self.message.topic)
            .field("partition", &self.message.partition)
            .field("session", &self.logs.as_ref().map(|l| l.session.as_str()))
            .finish()
    }
}

impl MessageContext {
    fn new(message: InboundMessage, logger: AuditLogger, producer: Arc<Producer>) -> Self {
        Self {
            message,
            logger,
            producer,
            logs: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn partition(&self) -> i32 {
        self.message.partition
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.message.headers
    }

    /// Raw message value as text
    pub fn value(&self) -> Option<&str> {
        self.message.value.as_deref()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.message.envelope
    }

    pub fn body(&self) -> &Value {
        &self.message.envelope.body
    }

    /// Open the message's correlated logs and record the message as the
    /// first input event.
    ///
    /// The session is `<envelope session>-<generated id>` when the sender
    /// propagated one, otherwise a fresh id for `scenario`. Later calls
    /// return the logs already opened.
    pub fn common_log(&mut self, scenario: &str, identity: Option<&str>) -> &mut CommonLog {
        let (logger, message) = (&self.logger, &self.message);
        self.logs
            .get_or_insert_with(|| open_message_logs(logger, message, scenario, identity))
    }

    /// The message's logs, if a handler or the dispatcher opened them
    pub fn logs(&mut self) -> Option<&mut CommonLog> {
        self.logs.as_mut()
    }

    /// Publish from inside a handler, logged against this message
    pub async fn send_message(&mut self, topic: &str, payload: &Value) -> SendResult {
        let producer = self.producer.clone();
        let scenario = self.message.topic.clone();
        let logs = self.common_log(&scenario, None);
        producer
            .produce_message(topic, payload, &mut logs.detail_log, &mut logs.summary_log)
            .await
            .to_send_result()
    }
}

fn open_message_logs(
    logger: &AuditLogger,
    message: &InboundMessage,
    scenario: &str,
    identity: Option<&str>,
) -> CommonLog {
    let generated = generate_xtid(scenario);
    let session = match message.envelope.session() {
        Some(parent) => format!("{}-{}", parent, generated),
        None => generated,
    };

    let mut logs = logger.common_log(scenario, identity, Some(&session));
    let invoke = logs.init_invoke.clone();
    let request = json!({
        "session": logs.session,
        "body": message.envelope.body,
        "protocol": "kafka",
    });
    logs.detail_log
        .add_input_request(KAFKA_PRODUCER, scenario, &invoke, &request);
    logs
}

/// How a single message was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Handler succeeded
    Handled,
    /// Validation or handler failure; logs closed with a server error
    Failed,
    /// No handler for the topic; dropped without an audit record
    Unrouted,
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub handled: u64,
    pub failed: u64,
    pub unrouted: u64,
    /// Receive errors the consume loop recovered from
    pub stream_errors: u64,
}

#[derive(Default)]
struct Counters {
    handled: AtomicU64,
    failed: AtomicU64,
    unrouted: AtomicU64,
    stream_errors: AtomicU64,
}

struct Route {
    handler: Arc<dyn MessageHandler>,
    schema: Option<TopicSchema>,
}

/// Topic router over a bus provider
pub struct MessageDispatcher {
    logger: AuditLogger,
    bus: Option<Arc<dyn BusProvider>>,
    producer: Arc<Producer>,
    routes: HashMap<String, Route>,
    counters: Counters,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("bus", &self.bus.as_ref().map(|b| b.name().to_string()))
            .field("topics", &self.topics())
            .field("stats", &self.stats())
            .finish()
    }
}

impl MessageDispatcher {
    /// Dispatcher consuming from and publishing to `bus`
    pub fn new(logger: AuditLogger, bus: Arc<dyn BusProvider>) -> Self {
        Self {
            logger,
            producer: Arc::new(Producer::new(bus.clone())),
            bus: Some(bus),
            routes: HashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Dispatcher fed by [`dispatch`](Self::dispatch) directly; publishing
    /// reports `Producer not initialized`
    pub fn without_bus(logger: AuditLogger) -> Self {
        Self {
            logger,
            producer: Arc::new(Producer::uninitialized()),
            bus: None,
            routes: HashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn register(&mut self, topic: impl Into<String>, handler: impl MessageHandler + 'static) -> &mut Self {
        self.insert_route(topic.into(), Arc::new(handler), None)
    }

    /// Register a handler whose messages must pass `schema` first
    pub fn register_with_schema(
        &mut self,
        topic: impl Into<String>,
        handler: impl MessageHandler + 'static,
        schema: TopicSchema,
    ) -> &mut Self {
        self.insert_route(topic.into(), Arc::new(handler), Some(schema))
    }

    fn insert_route(
        &mut self,
        topic: String,
        handler: Arc<dyn MessageHandler>,
        schema: Option<TopicSchema>,
    ) -> &mut Self {
        tracing::debug!(topic = %topic, validated = schema.is_some(), "Handler registered");
        if self.routes.insert(topic.clone(), Route { handler, schema }).is_some() {
            tracing::warn!(topic = %topic, "Handler replaced");
        }
        self
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn producer(&self) -> Arc<Producer> {
        self.producer.clone()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            handled: self.counters.handled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
            stream_errors: self.counters.stream_errors.load(Ordering::Relaxed),
        }
    }

    /// Process one message. Never fails: every error is recorded in the
    /// message's logs and reflected in the returned status.
    pub async fn dispatch(&self, raw: &RawMessage) -> DispatchStatus {
        let message = raw.normalize();
        let Some(route) = self.routes.get(&message.topic) else {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                topic = %message.topic,
                partition = message.partition,
                "No handler for topic, message dropped"
            );
            return DispatchStatus::Unrouted;
        };

        let mut ctx = MessageContext::new(message, self.logger.clone(), self.producer.clone());
        let result = Self::invoke(route, &mut ctx).await;
        let status = Self::close_logs(&mut ctx, result).await;

        let counter = match status {
            DispatchStatus::Handled => &self.counters.handled,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        status
    }

    async fn invoke(route: &Route, ctx: &mut MessageContext) -> Result<HandlerReply> {
        if let Some(schema) = &route.schema {
            let headers = serde_json::to_value(ctx.headers())?;
            schema.validate(ctx.body(), &headers)?;
        }

        match AssertUnwindSafe(route.handler.handle(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(TxLogError::Handler(panic_message(panic.as_ref()))),
        }
    }

    async fn close_logs(ctx: &mut MessageContext, result: Result<HandlerReply>) -> DispatchStatus {
        let topic = ctx.topic().to_string();

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                let logs = ctx.common_log(&topic, None);
                record_failure(logs, &err);
                tracing::warn!(
                    topic = %topic,
                    session = %logs.session,
                    error = %err,
                    "Message processing failed"
                );
                return DispatchStatus::Failed;
            }
        };

        if let Some((target, payload)) = &reply.publish {
            let sent = ctx.send_message(target, payload).await;
            if sent.err {
                tracing::warn!(
                    topic = %topic,
                    target = %target,
                    error = %sent.result_desc,
                    "Chained publish failed"
                );
            }
        }

        let logs = ctx.common_log(&topic, None);
        let scenario = logs.detail_log.scenario().to_string();
        let invoke = logs.init_invoke.clone();
        if !logs.detail_log.is_end() {
            logs.detail_log.add_output_request(
                KAFKA_CONSUMER,
                &scenario,
                &invoke,
                "",
                reply.data,
                None,
                None,
            );
            end_detail(&mut logs.detail_log);
        }
        if !logs.summary_log.is_end() {
            end_summary(&mut logs.summary_log, "", "success");
        }
        DispatchStatus::Handled
    }

    /// Subscribe to every registered topic
    pub async fn listen(&self) -> Result<Box<dyn Subscription>> {
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| TxLogError::NotInitialized("Consumer".to_string()))?;
        let topics = self.topics();
        tracing::info!(provider = bus.name(), topics = ?topics, "Dispatcher listening");
        bus.subscribe(&topics).await
    }

    /// Dispatch and ack messages until the subscription ends
    ///
    /// A receive error does not end the loop: it is counted, logged, and
    /// followed by a backoff that grows with consecutive errors.
    pub async fn run(&self, mut subscription: Box<dyn Subscription>) -> Result<()> {
        let mut consecutive_errors: u32 = 0;
        loop {
            let pending = match subscription.next().await {
                Ok(Some(pending)) => pending,
                Ok(None) => break,
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.counters.stream_errors.fetch_add(1, Ordering::Relaxed);
                    let delay = stream_backoff(consecutive_errors);
                    tracing::warn!(
                        error = %e,
                        consecutive = consecutive_errors,
                        backoff_ms = delay.as_millis() as u64,
                        "Subscription receive failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            consecutive_errors = 0;

            let status = self.dispatch(pending.message()).await;
            tracing::debug!(topic = %pending.message().topic, status = ?status, "Message dispatched");
            if let Err(e) = pending.ack().await {
                tracing::warn!(error = %e, "Ack failed");
            }
        }
        tracing::info!(stats = ?self.stats(), "Subscription ended");
        Ok(())
    }

    /// [`listen`](Self::listen) then [`run`](Self::run)
    pub async fn start(&self) -> Result<()> {
        let subscription = self.listen().await?;
        self.run(subscription).await
    }

    /// Release the bus connection
    pub async fn close(&self) -> Result<()> {
        if let Some(bus) = &self.bus {
            bus.disconnect().await?;
        }
        Ok(())
    }
}

/// 100ms per consecutive receive error, capped at 5s
fn stream_backoff(consecutive_errors: u32) -> Duration {
    Duration::from_millis(100 * u64::from(consecutive_errors)).min(MAX_STREAM_BACKOFF)
}

/// Record a failed message and close whatever is still open
fn record_failure(logs: &mut CommonLog, err: &TxLogError) {
    let scenario = logs.summary_log.scenario().to_string();
    let invoke = logs.init_invoke.clone();

    match err {
        TxLogError::Validation { path, message } => {
            logs.summary_log
                .add_error_block(KAFKA_CONSUMER, &scenario, "null", "Invalid schema");
            if !logs.detail_log.is_end() {
                logs.detail_log.add_output_request(
                    KAFKA_CONSUMER,
                    &scenario,
                    &invoke,
                    "",
                    json!({ "path": path, "message": message }),
                    None,
                    None,
                );
            }
        }
        other => {
            logs.summary_log.add_field("errorCause", other.to_string());
        }
    }

    if !logs.detail_log.is_end() {
        end_detail(&mut logs.detail_log);
    }
    if !logs.summary_log.is_end() {
        end_summary(&mut logs.summary_log, "500", "server_error");
    }
}

fn end_detail(log: &mut DetailLog) {
    if let Err(e) = log.end() {
        tracing::error!(session = %log.session(), error = %e, "Detail log close failed");
    }
}

fn end_summary(log: &mut SummaryLog, code: &str, desc: &str) {
    if let Err(e) = log.end(code, desc) {
        tracing::error!(session = %log.session(), error = %e, "Summary log close failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
