//! JetStream pull subscription adapter

use super::config::NatsConfig;
use crate::error::{Result, TxLogError};
use crate::provider::{PendingMessage, Subscription};
use crate::types::RawMessage;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;

/// Messages from a durable pull consumer, acked explicitly
pub struct NatsSubscription {
    messages: jetstream::consumer::pull::Stream,
    config: Arc<NatsConfig>,
}

impl NatsSubscription {
    pub(crate) fn new(messages: jetstream::consumer::pull::Stream, config: Arc<NatsConfig>) -> Self {
        Self { messages, config }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        let msg = match self.messages.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                return Err(TxLogError::Subscribe {
                    topic: self.config.subject_prefix.clone(),
                    reason: e.to_string(),
                })
            }
            None => return Ok(None),
        };

        let subject = msg.subject.as_str();
        let topic = self.config.topic(subject).unwrap_or(subject).to_string();

        let mut headers = Vec::new();
        if let Some(map) = &msg.headers {
            for (name, values) in map.iter() {
                for value in values {
                    headers.push((name.to_string(), Bytes::from(value.as_str().to_string())));
                }
            }
        }

        let raw = RawMessage {
            topic,
            partition: 0,
            headers,
            value: Some(msg.payload.clone()),
        };

        let msg = Arc::new(msg);
        let ack_msg = msg.clone();
        let nak_msg = msg;

        Ok(Some(PendingMessage::new(
            raw,
            move || {
                Box::pin(async move {
                    ack_msg.ack().await.map_err(|e| TxLogError::Subscribe {
                        topic: ack_msg.subject.to_string(),
                        reason: format!("ack failed: {}", e),
                    })
                })
            },
            move || {
                Box::pin(async move {
                    nak_msg
                        .ack_with(jetstream::AckKind::Nak(None))
                        .await
                        .map_err(|e| TxLogError::Subscribe {
                            topic: nak_msg.subject.to_string(),
                            reason: format!("nak failed: {}", e),
                        })
                })
            },
        )))
    }
}
