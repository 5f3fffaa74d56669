//! NATS JetStream broker adapter.
//!
//! One durable pull consumer feeds every subscription on this adapter. A
//! single consume task reads from the consumer and routes each message by
//! subject through the [`SubjectRegistry`]; per-subject forwarder tasks
//! attach the JetStream acknowledgment and feed the subscription stream.
//!
//! The consume task starts lazily with the first subscription, restarts if
//! it has died when a new subscription arrives, and is aborted when the
//! last subscription is removed. Messages for subjects with no registered
//! subscription are acknowledged and dropped so they do not redeliver
//! forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream, AckKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::nats::{connect, from_nats_headers, to_nats_headers};
use super::{BrokerController, BrokerError, Result};
use crate::message::{Acknowledgment, AcknowledgeableBrokerMessage, BrokerMessage};
use crate::subscription::{subscription_pair, Subscription, DEFAULT_CAPACITY};

/// Default delay before a negatively acknowledged message is redelivered.
const DEFAULT_NAK_REDELIVERY_DELAY_MS: u64 = 5000;

/// Stream provisioning parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamSpec {
    /// Stream name.
    pub name: String,
    /// Subjects bound to the stream. Empty leaves an existing stream's
    /// subject set untouched.
    pub subjects: Vec<String>,
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            name: "polybus".to_string(),
            subjects: Vec::new(),
        }
    }
}

/// Durable consumer parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsumerSpec {
    /// Consumer name.
    pub name: String,
    /// Durable name. Defaults to the consumer name.
    pub durable_name: Option<String>,
}

impl Default for ConsumerSpec {
    fn default() -> Self {
        Self {
            name: "polybus".to_string(),
            durable_name: None,
        }
    }
}

/// Configuration for the JetStream adapter.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JetStreamConfig {
    /// NATS server URL.
    pub url: String,
    /// Connection name reported to the server.
    pub connection_name: String,
    /// Path to a credentials file (optional).
    pub credentials_path: Option<String>,
    /// Stream to provision and publish into.
    pub stream: StreamSpec,
    /// Durable consumer every subscription shares.
    pub consumer: ConsumerSpec,
    /// Redelivery delay applied to negative acknowledgments, in
    /// milliseconds.
    pub nak_redelivery_delay_ms: u64,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connection_name: "polybus".to_string(),
            credentials_path: None,
            stream: StreamSpec::default(),
            consumer: ConsumerSpec::default(),
            nak_redelivery_delay_ms: DEFAULT_NAK_REDELIVERY_DELAY_MS,
        }
    }
}

impl JetStreamConfig {
    /// Create a config for the given server URL and stream name.
    pub fn new(url: impl Into<String>, stream_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: StreamSpec {
                name: stream_name.into(),
                subjects: Vec::new(),
            },
            ..Default::default()
        }
    }

    /// Set the subjects bound to the stream.
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.stream.subjects = subjects;
        self
    }

    /// Set the durable consumer name.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer.name = name.into();
        self
    }

    /// Set the redelivery delay for negative acknowledgments.
    pub fn with_nak_redelivery_delay(mut self, delay: Duration) -> Self {
        self.nak_redelivery_delay_ms = delay.as_millis() as u64;
        self
    }
}

// ============================================================================
// Subject registry
// ============================================================================

struct RegistryState<T> {
    channels: HashMap<String, mpsc::Sender<T>>,
    consume_task: Option<JoinHandle<()>>,
}

/// Routes messages from the shared consume task to per-subject senders,
/// and ties the consume task's lifecycle to the registry population.
///
/// Generic over the routed message type so routing and lifecycle logic can
/// be tested without a JetStream connection.
struct SubjectRegistry<T> {
    state: Mutex<RegistryState<T>>,
}

impl<T> SubjectRegistry<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                channels: HashMap::new(),
                consume_task: None,
            }),
        }
    }

    /// Register a subject. Returns `false` if the subject already has a
    /// live registration.
    async fn register(&self, subject: &str, sender: mpsc::Sender<T>) -> bool {
        let mut state = self.state.lock().await;
        if state.channels.contains_key(subject) {
            return false;
        }
        state.channels.insert(subject.to_string(), sender);
        true
    }

    /// Ensure the consume task is running, spawning it with `spawn` if it
    /// never started or has since finished.
    async fn ensure_consuming<F>(&self, spawn: F)
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut state = self.state.lock().await;
        let alive = state
            .consume_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if !alive {
            state.consume_task = Some(spawn());
        }
    }

    /// Look up the sender for a subject.
    async fn route(&self, subject: &str) -> Option<mpsc::Sender<T>> {
        self.state.lock().await.channels.get(subject).cloned()
    }

    /// Remove a subject. Aborts the consume task when the last subject
    /// goes away.
    async fn remove(&self, subject: &str) {
        let mut state = self.state.lock().await;
        state.channels.remove(subject);
        if state.channels.is_empty() {
            if let Some(task) = state.consume_task.take() {
                task.abort();
            }
        }
    }

    /// Drop every registration and stop the consume task.
    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.channels.clear();
        if let Some(task) = state.consume_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Acknowledgment
// ============================================================================

struct JetStreamAcknowledgment {
    message: jetstream::Message,
    nak_delay: Duration,
}

#[async_trait]
impl Acknowledgment for JetStreamAcknowledgment {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("Failed to ack: {}", e)))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(Some(self.nak_delay)))
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("Failed to nak: {}", e)))
    }
}

// ============================================================================
// Broker
// ============================================================================

/// NATS JetStream broker adapter.
pub struct JetStreamBroker {
    context: jetstream::Context,
    consumer: PullConsumer,
    registry: Arc<SubjectRegistry<jetstream::Message>>,
    nak_delay: Duration,
}

impl JetStreamBroker {
    /// Connect, provision the stream and durable consumer, and create the
    /// adapter.
    pub async fn new(config: JetStreamConfig) -> Result<Self> {
        let client = connect(
            &config.url,
            &config.connection_name,
            config.credentials_path.as_deref(),
        )
        .await?;
        let context = jetstream::new(client);

        let stream = Self::ensure_stream(&context, &config.stream).await?;
        let consumer = Self::ensure_consumer(&stream, &config.consumer).await?;

        info!(
            url = %config.url,
            stream = %config.stream.name,
            consumer = %config.consumer.name,
            "Connected to JetStream"
        );

        Ok(Self {
            context,
            consumer,
            registry: Arc::new(SubjectRegistry::new()),
            nak_delay: Duration::from_millis(config.nak_redelivery_delay_ms),
        })
    }

    /// Get the stream, updating its subjects when the spec names any, or
    /// create it from scratch.
    async fn ensure_stream(
        context: &jetstream::Context,
        spec: &StreamSpec,
    ) -> Result<stream::Stream> {
        match context.get_stream(&spec.name).await {
            Ok(stream) => {
                if spec.subjects.is_empty() {
                    return Ok(stream);
                }
                let mut config = stream.cached_info().config.clone();
                for subject in &spec.subjects {
                    if !config.subjects.contains(subject) {
                        config.subjects.push(subject.clone());
                    }
                }
                context.update_stream(&config).await.map_err(|e| {
                    BrokerError::Connection(format!(
                        "Failed to update stream '{}': {}",
                        spec.name, e
                    ))
                })?;
                context.get_stream(&spec.name).await.map_err(|e| {
                    BrokerError::Connection(format!("Failed to get stream '{}': {}", spec.name, e))
                })
            }
            Err(_) => context
                .create_stream(stream::Config {
                    name: spec.name.clone(),
                    subjects: spec.subjects.clone(),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    BrokerError::Connection(format!(
                        "Failed to create stream '{}': {}",
                        spec.name, e
                    ))
                }),
        }
    }

    async fn ensure_consumer(
        stream: &stream::Stream,
        spec: &ConsumerSpec,
    ) -> Result<PullConsumer> {
        let durable = spec
            .durable_name
            .clone()
            .unwrap_or_else(|| spec.name.clone());

        stream
            .get_or_create_consumer(
                &spec.name,
                pull::Config {
                    durable_name: Some(durable),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BrokerError::Connection(format!(
                    "Failed to create consumer '{}': {}",
                    spec.name, e
                ))
            })
    }

    fn spawn_consume_loop(&self) -> JoinHandle<()> {
        let consumer = self.consumer.clone();
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let mut messages = match consumer.messages().await {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "Failed to open JetStream message stream");
                    return;
                }
            };

            while let Some(item) = messages.next().await {
                let native = match item {
                    Ok(native) => native,
                    Err(e) => {
                        error!(error = %e, "JetStream consume error");
                        continue;
                    }
                };

                let subject = native.subject.to_string();
                match registry.route(&subject).await {
                    Some(sender) => {
                        if sender.send(native).await.is_err() {
                            // Forwarder gone between route and send. The
                            // message redelivers after the ack deadline.
                            debug!(subject = %subject, "Dropped message for closing subscription");
                        }
                    }
                    None => {
                        // No subscription for this subject. Ack so the
                        // consumer does not redeliver it forever.
                        warn!(subject = %subject, "No subscription for subject, discarding");
                        if let Err(e) = native.ack().await {
                            warn!(subject = %subject, error = %e, "Failed to ack orphan message");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl BrokerController for JetStreamBroker {
    async fn publish(&self, channel: &str, message: BrokerMessage) -> Result<()> {
        let headers = to_nats_headers(&message);

        let ack = self
            .context
            .publish_with_headers(channel.to_string(), headers, message.payload.into())
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish to '{}': {}", channel, e)))?;

        // Wait for the server's publish ack so persistence is confirmed.
        ack.await.map_err(|e| {
            BrokerError::Publish(format!("Publish to '{}' not acknowledged: {}", channel, e))
        })?;

        debug!(subject = %channel, "Published message to JetStream");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (route_tx, mut route_rx) = mpsc::channel::<jetstream::Message>(DEFAULT_CAPACITY);

        if !self.registry.register(channel, route_tx).await {
            return Err(BrokerError::AlreadySubscribed(channel.to_string()));
        }
        self.registry
            .ensure_consuming(|| self.spawn_consume_loop())
            .await;

        let (subscription, mut sender) = subscription_pair(channel, DEFAULT_CAPACITY);
        let registry = Arc::clone(&self.registry);
        let nak_delay = self.nak_delay;
        let channel = channel.to_string();

        tokio::spawn(async move {
            let done = loop {
                tokio::select! {
                    done = sender.cancel_requested() => break done,
                    item = route_rx.recv() => match item {
                        Some(native) => {
                            let message =
                                from_nats_headers(native.headers.as_ref(), &native.payload);
                            let received = AcknowledgeableBrokerMessage::with_acknowledgment(
                                message,
                                Box::new(JetStreamAcknowledgment {
                                    message: native,
                                    nak_delay,
                                }),
                            );
                            if !sender.transmit(received).await {
                                break None;
                            }
                        }
                        None => break None,
                    }
                }
            };

            registry.remove(&channel).await;
            route_rx.close();
            debug!(subject = %channel, "JetStream subscription closed");
            sender.confirm_cancel(done);
        });

        Ok(subscription)
    }

    async fn close(&self) {
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    #[test]
    fn test_config_defaults() {
        let config = JetStreamConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.stream.name, "polybus");
        assert!(config.stream.subjects.is_empty());
        assert_eq!(config.nak_redelivery_delay_ms, 5000);
    }

    #[test]
    fn test_config_builders() {
        let config = JetStreamConfig::new("nats://nats:4222", "orders")
            .with_subjects(vec!["orders.>".to_string()])
            .with_consumer_name("workers")
            .with_nak_redelivery_delay(Duration::from_secs(10));

        assert_eq!(config.stream.name, "orders");
        assert_eq!(config.stream.subjects, vec!["orders.>"]);
        assert_eq!(config.consumer.name, "workers");
        assert_eq!(config.nak_redelivery_delay_ms, 10_000);
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_subject() {
        let registry = SubjectRegistry::<u32>::new();
        let (tx, _rx) = mpsc::channel(1);

        assert!(registry.register("orders.created", tx.clone()).await);
        assert!(!registry.register("orders.created", tx).await);
    }

    #[tokio::test]
    async fn test_registry_routes_by_subject() {
        let registry = SubjectRegistry::<u32>::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register("orders.created", tx).await;

        let sender = registry.route("orders.created").await.unwrap();
        sender.send(7).await.unwrap();
        assert_eq!(rx.recv().await, Some(7));

        assert!(registry.route("orders.deleted").await.is_none());
    }

    #[tokio::test]
    async fn test_registry_reregister_after_remove() {
        let registry = SubjectRegistry::<u32>::new();
        let (tx, _rx) = mpsc::channel(1);

        assert!(registry.register("orders.created", tx.clone()).await);
        registry.remove("orders.created").await;
        assert!(registry.register("orders.created", tx).await);
    }

    #[tokio::test]
    async fn test_consume_task_starts_once_while_alive() {
        let registry = SubjectRegistry::<u32>::new();
        let mut spawned = 0;

        registry
            .ensure_consuming(|| {
                spawned += 1;
                pending_task()
            })
            .await;
        registry
            .ensure_consuming(|| {
                spawned += 1;
                pending_task()
            })
            .await;

        assert_eq!(spawned, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_consume_task_restarts_after_finish() {
        let registry = SubjectRegistry::<u32>::new();

        let first = tokio::spawn(async {});
        // Let the first task run to completion.
        tokio::task::yield_now().await;
        while !first.is_finished() {
            tokio::task::yield_now().await;
        }

        let mut spawned = 0;
        registry.ensure_consuming(|| first).await;
        registry
            .ensure_consuming(|| {
                spawned += 1;
                pending_task()
            })
            .await;

        assert_eq!(spawned, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_last_removal_stops_consume_task() {
        let registry = SubjectRegistry::<u32>::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register("a", tx.clone()).await;
        registry.register("b", tx).await;

        let task = pending_task();
        let probe = task.abort_handle();
        registry.ensure_consuming(|| task).await;

        registry.remove("a").await;
        assert!(!probe.is_finished());

        registry.remove("b").await;
        tokio::task::yield_now().await;
        assert!(probe.is_finished());
    }

    fn integration_config() -> JetStreamConfig {
        let url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        let id = uuid::Uuid::new_v4().simple().to_string();
        JetStreamConfig::new(url, format!("polybus-test-{}", id))
            .with_subjects(vec![format!("pbtest.{}.>", id)])
            .with_consumer_name(format!("polybus-test-{}", id))
    }

    #[tokio::test]
    #[ignore = "Requires NATS with JetStream"]
    async fn test_jetstream_publish_subscribe_ack() {
        let config = integration_config();
        let subject = format!("{}sub", config.stream.subjects[0].trim_end_matches('>'));
        let broker = JetStreamBroker::new(config).await.unwrap();

        let mut subscription = broker.subscribe(&subject).await.unwrap();

        broker
            .publish(&subject, BrokerMessage::new(b"durable".to_vec()))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(10), subscription.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream closed");
        assert_eq!(received.message.payload, b"durable");
        received.ack().await.unwrap();

        subscription.cancel().await;
        broker.close().await;
    }

    #[tokio::test]
    #[ignore = "Requires NATS with JetStream"]
    async fn test_jetstream_duplicate_subscribe_rejected() {
        let config = integration_config();
        let subject = format!("{}dup", config.stream.subjects[0].trim_end_matches('>'));
        let broker = JetStreamBroker::new(config).await.unwrap();

        let _subscription = broker.subscribe(&subject).await.unwrap();
        let second = broker.subscribe(&subject).await;
        assert!(matches!(second, Err(BrokerError::AlreadySubscribed(_))));

        broker.close().await;
    }
}
