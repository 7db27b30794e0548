//! Inbound pub/sub delivery and outbound notifications.

use crate::error::Cause;
use crate::manifest::WILDCARD_TOPIC;
use crate::plugin::Plugin;
use crate::protocol::Notification;
use crate::transport::{MessageWriter, TransportError};
use futures::future::BoxFuture;
use futures::FutureExt;
use lnplug_core::LogLevel;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Topic the host sends when it is about to exit.
pub const SHUTDOWN_TOPIC: &str = "shutdown";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Assert failed: {0}")]
    Assertion(String),
    #[error("payload for '{topic}' is not serializable: {source}")]
    Serialize {
        topic: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One inbound notification as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    /// The plugin that emitted a custom notification, if any.
    pub origin: Option<String>,
    /// Received before init completed.
    pub pre_init: bool,
}

impl Envelope {
    /// Custom notifications arrive wrapped as `{"origin": .., "payload": ..}`;
    /// built-in topics carry their payload directly.
    pub fn new(topic: impl Into<String>, params: Value, pre_init: bool) -> Self {
        let topic = topic.into();
        match params {
            Value::Object(mut fields) if fields.contains_key("payload") => {
                let origin = fields
                    .get("origin")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let payload = fields.remove("payload").unwrap_or(Value::Null);
                Self {
                    topic,
                    payload,
                    origin,
                    pre_init,
                }
            }
            payload => Self {
                topic,
                payload,
                origin: None,
                pre_init,
            },
        }
    }
}

pub type SubscriberFn<S> =
    Arc<dyn Fn(Plugin<S>, Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) fn subscriber_fn<S, F, Fut>(callback: F) -> SubscriberFn<S>
where
    S: Send + Sync + 'static,
    F: Fn(Plugin<S>, Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |plugin, envelope| callback(plugin, envelope).boxed())
}

/// Subscribers in registration order, keyed by topic or the wildcard.
pub struct SubscriptionSet<S> {
    entries: Vec<(String, SubscriberFn<S>)>,
}

impl<S> SubscriptionSet<S> {
    pub fn new(entries: Vec<(String, SubscriberFn<S>)>) -> Self {
        Self { entries }
    }

    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a SubscriberFn<S>> + 'a {
        self.entries
            .iter()
            .filter(move |(t, _)| t == topic || t == WILDCARD_TOPIC)
            .map(|(_, callback)| callback)
    }
}

/// Bounded FIFO of notifications received before init completed.
#[derive(Debug)]
pub struct PreInitBuffer {
    queue: VecDeque<Envelope>,
    capacity: usize,
}

impl PreInitBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, envelope: Envelope) {
        if self.queue.len() == self.capacity {
            if let Some(dropped) = self.queue.pop_front() {
                tracing::warn!(
                    topic = %dropped.topic,
                    capacity = self.capacity,
                    "pre-init notification buffer full, dropping oldest"
                );
            }
        }
        self.queue.push_back(envelope);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Envelope> + '_ {
        self.queue.drain(..)
    }
}

/// Delivers envelopes to subscribers one at a time, in receipt order.
pub struct Delivery {
    tx: mpsc::UnboundedSender<Envelope>,
    worker: JoinHandle<()>,
}

impl Delivery {
    pub fn spawn<S: Send + Sync + 'static>(plugin: Plugin<S>, subscriptions: SubscriptionSet<S>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let worker = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                for callback in subscriptions.matching(&envelope.topic) {
                    let running = callback(plugin.clone(), envelope.clone());
                    let failure = match AssertUnwindSafe(running).catch_unwind().await {
                        Ok(Ok(())) => continue,
                        Ok(Err(err)) => Cause::from_error("subscriber", &err),
                        Err(payload) => Cause::from_panic(payload.as_ref()),
                    };
                    let message = format!(
                        "Error while handling notification {{topic: {}}}: {failure}",
                        envelope.topic
                    );
                    plugin.log(LogLevel::Error, &message).await;
                }
            }
        });
        Self { tx, worker }
    }

    pub fn deliver(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            tracing::warn!("notification worker is gone, dropping notification");
        }
    }

    /// Stop accepting envelopes and wait for the queued ones to be handled.
    pub async fn finish(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            tracing::error!(error = %err, "notification worker ended abnormally");
        }
    }
}

/// Serialize and write one outbound notification.
pub async fn send<P: Serialize + ?Sized>(
    writer: &MessageWriter,
    topic: &str,
    payload: &P,
) -> Result<(), NotifyError> {
    let params = serde_json::to_value(payload).map_err(|source| NotifyError::Serialize {
        topic: topic.to_string(),
        source,
    })?;
    writer.write_message(&Notification::new(topic, params)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn custom_envelopes_are_unpacked() {
        let custom = Envelope::new(
            "custom",
            json!({"origin": "notify-plugin", "payload": {"message": "hi"}}),
            false,
        );
        assert_eq!(custom.origin.as_deref(), Some("notify-plugin"));
        assert_eq!(custom.payload, json!({"message": "hi"}));

        let builtin = Envelope::new("connect", json!({"id": "02aa"}), true);
        assert_eq!(builtin.origin, None);
        assert_eq!(builtin.payload, json!({"id": "02aa"}));
        assert!(builtin.pre_init);
    }

    #[test]
    fn wildcard_subscribers_match_every_topic() {
        let noop: SubscriberFn<()> = subscriber_fn(|_, _| async { Ok(()) });
        let set = SubscriptionSet::new(vec![
            ("connect".to_string(), Arc::clone(&noop)),
            (WILDCARD_TOPIC.to_string(), Arc::clone(&noop)),
        ]);
        assert_eq!(set.matching("connect").count(), 2);
        assert_eq!(set.matching("disconnect").count(), 1);
    }

    #[test]
    fn pre_init_buffer_drops_oldest_when_full() {
        let mut buffer = PreInitBuffer::new(2);
        for i in 0..3 {
            buffer.push(Envelope::new("warning", json!({"i": i}), true));
        }
        assert_eq!(buffer.len(), 2);
        let kept: Vec<_> = buffer.drain().map(|e| e.payload["i"].as_i64().unwrap()).collect();
        assert_eq!(kept, vec![1, 2]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn unserializable_payload_is_an_error_not_a_panic() {
        let (_host, plugin) = tokio::io::duplex(1024);
        let writer = MessageWriter::new(plugin);
        let mut payload = std::collections::HashMap::new();
        payload.insert((1, 2), "tuple keys");
        let err = send(&writer, "topic-0", &payload).await.unwrap_err();
        assert!(matches!(err, NotifyError::Serialize { .. }));
    }
}
