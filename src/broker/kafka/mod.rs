//! Kafka broker adapter.
//!
//! Publishing uses a shared `FutureProducer` with auto topic creation
//! enabled. A publish hitting a topic the cluster has not provisioned yet
//! (`UnknownTopicOrPartition`) is retried at a fixed short interval until
//! the topic appears; every other producer error is terminal. Each
//! subscription opens its own `StreamConsumer` bound to the configured
//! consumer group.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Message};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{BrokerController, BrokerError, Result};
use crate::message::{AcknowledgeableBrokerMessage, BrokerMessage};
use crate::subscription::{subscription_pair, Subscription, DEFAULT_CAPACITY};

/// Delay between publish attempts while a topic is being provisioned.
const TOPIC_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for the Kafka adapter.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Consumer group ID. Override per instance to avoid cross-test or
    /// cross-instance message collisions.
    pub group_id: String,
    /// Partition index publishes are routed to.
    pub partition: i32,
    /// Maximum message size in bytes, applied to producer and consumer.
    pub max_message_bytes: usize,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "polybus".to_string(),
            partition: 0,
            max_message_bytes: 1_048_576,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

impl KafkaConfig {
    /// Create a config for the given bootstrap servers.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Set the consumer group ID.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Set the partition publishes are routed to.
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    /// Set the maximum message size in bytes.
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set the security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set the SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    /// Build a ClientConfig for the producer.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        config.set("message.max.bytes", self.max_message_bytes.to_string());
        config.set("allow.auto.create.topics", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for consumers.
    fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", &self.group_id);
        config.set("enable.auto.commit", "true");
        config.set("auto.offset.reset", "earliest");
        config.set("allow.auto.create.topics", "true");
        config.set("fetch.message.max.bytes", self.max_message_bytes.to_string());

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

/// Kafka broker adapter.
pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaBroker {
    /// Create a new Kafka broker adapter.
    pub async fn new(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config.build_producer_config().create().map_err(|e| {
            BrokerError::Connection(format!("Failed to create Kafka producer: {}", e))
        })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %config.group_id,
            "Connected to Kafka"
        );

        Ok(Self { producer, config })
    }
}

/// True for the one producer error that means "topic not provisioned yet",
/// which the adapter retries internally.
fn is_unprovisioned_topic(error: &KafkaError) -> bool {
    matches!(
        error,
        KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition)
    )
}

/// Run a send attempt, retrying only while the topic is unprovisioned.
///
/// The loop has no attempt cap: with auto topic creation enabled the
/// condition clears once the cluster catches up, and a caller bounds the
/// wait by dropping the future or wrapping it in a timeout.
async fn send_with_provisioning_retry<F, Fut>(topic: &str, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), KafkaError>>,
{
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(error) if is_unprovisioned_topic(&error) => {
                warn!(
                    topic = %topic,
                    "Topic not yet provisioned, retrying publish"
                );
                tokio::time::sleep(TOPIC_RETRY_DELAY).await;
            }
            Err(error) => {
                return Err(BrokerError::Publish(format!(
                    "Failed to publish to '{}': {}",
                    topic, error
                )))
            }
        }
    }
}

fn to_kafka_headers(message: &BrokerMessage) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (key, value) in &message.headers {
        headers = headers.insert(Header {
            key,
            value: Some(value.as_slice()),
        });
    }
    headers
}

fn from_kafka_message(native: &BorrowedMessage<'_>) -> BrokerMessage {
    let mut message = BrokerMessage::new(native.payload().unwrap_or_default().to_vec());
    if let Some(headers) = native.headers() {
        for header in headers.iter() {
            message.headers.insert(
                header.key.to_string(),
                header.value.unwrap_or_default().to_vec(),
            );
        }
    }
    message
}

#[async_trait]
impl BrokerController for KafkaBroker {
    async fn publish(&self, channel: &str, message: BrokerMessage) -> Result<()> {
        let headers = to_kafka_headers(&message);
        let partition = self.config.partition;

        send_with_provisioning_retry(channel, || {
            let record = FutureRecord::<(), _>::to(channel)
                .payload(&message.payload)
                .partition(partition)
                .headers(headers.clone());

            async move {
                self.producer
                    .send(record, Duration::from_secs(5))
                    .await
                    .map(|_| ())
                    .map_err(|(error, _)| error)
            }
        })
        .await?;

        debug!(topic = %channel, partition, "Published message to Kafka");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let consumer: StreamConsumer = self.config.build_consumer_config().create().map_err(|e| {
            BrokerError::Connection(format!("Failed to create Kafka consumer: {}", e))
        })?;

        consumer
            .subscribe(&[channel])
            .map_err(|e| BrokerError::Subscribe(format!("Failed to subscribe to '{}': {}", channel, e)))?;

        let (subscription, mut sender) = subscription_pair(channel, DEFAULT_CAPACITY);
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut stream = consumer.stream();

            let done = loop {
                tokio::select! {
                    done = sender.cancel_requested() => break done,
                    item = stream.next() => match item {
                        Some(Ok(native)) => {
                            let message = from_kafka_message(&native);
                            if !sender
                                .transmit(AcknowledgeableBrokerMessage::new(message))
                                .await
                            {
                                break None;
                            }
                        }
                        Some(Err(e)) => {
                            // Includes deliberate close: logged, never propagated.
                            error!(channel = %channel, error = %e, "Kafka consumer read failed");
                            break None;
                        }
                        None => break None,
                    }
                }
            };

            drop(stream);
            drop(consumer);
            debug!(channel = %channel, "Kafka subscription closed");
            sender.confirm_cancel(done);
        });

        Ok(subscription)
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Duration::from_secs(5)) {
            debug!(error = %e, "Kafka producer flush on close failed");
        }
    }
}
