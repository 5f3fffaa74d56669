//! Broker contract and per-transport adapters.
//!
//! This module contains:
//! - `BrokerController` trait: publish/subscribe/close against one transport
//! - `BrokerError`: the error taxonomy shared by adapters and the runtime
//! - Adapter configuration union and the `init_broker` factory
//! - Implementations: in-memory, Kafka, NATS core, NATS JetStream, AMQP (RabbitMQ)

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::message::BrokerMessage;
use crate::subscription::Subscription;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "nats")]
pub mod jetstream;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig, AmqpExchangeKind};
#[cfg(feature = "nats")]
pub use jetstream::{ConsumerSpec, JetStreamBroker, JetStreamConfig, StreamSpec};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaConfig};
pub use memory::InMemoryBroker;
#[cfg(feature = "nats")]
pub use nats::{NatsBroker, NatsConfig};

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgment failed: {0}")]
    Acknowledge(String),

    #[error("Already subscribed to channel '{0}'")]
    AlreadySubscribed(String),

    #[error("Subscription canceled before a matching message arrived")]
    SubscriptionCanceled,

    #[error("Operation canceled by caller")]
    ContextCanceled,

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Interface every transport adapter satisfies.
///
/// Implementations:
/// - `InMemoryBroker`: tokio channels, tests and standalone use
/// - `KafkaBroker`: Kafka via rdkafka
/// - `NatsBroker`: NATS core via async-nats
/// - `JetStreamBroker`: NATS JetStream durable consumers
/// - `AmqpBroker`: RabbitMQ via lapin
///
/// Each adapter owns its native client connection; adapter instances share
/// no state with each other. Cancellation of a pending `publish` is the
/// caller's concern: drop the future or wrap it in `tokio::time::timeout`.
#[async_trait]
pub trait BrokerController: Send + Sync {
    /// Publish a message on a channel. Blocks until the transport accepts
    /// the message or a terminal error occurs. Transient "not yet
    /// provisioned" conditions are retried internally (see the Kafka
    /// adapter); everything else is returned immediately.
    async fn publish(&self, channel: &str, message: BrokerMessage) -> Result<()>;

    /// Register interest in a channel. Returns immediately; delivery
    /// happens asynchronously on a spawned task feeding the returned
    /// [`Subscription`].
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Release all transport resources. Subsequent operations on this
    /// adapter are undefined.
    async fn close(&self);
}

// ============================================================================
// Configuration
// ============================================================================

/// Broker type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// In-process broker, no external deps.
    #[default]
    Memory,
    /// Kafka.
    Kafka,
    /// NATS core (fire-and-forget).
    Nats,
    /// NATS JetStream (durable consumer, acknowledgments).
    Jetstream,
    /// RabbitMQ via AMQP.
    Amqp,
}

/// Broker configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// Kafka-specific configuration.
    #[cfg(feature = "kafka")]
    pub kafka: KafkaConfig,
    /// NATS core configuration.
    #[cfg(feature = "nats")]
    pub nats: NatsConfig,
    /// NATS JetStream configuration.
    #[cfg(feature = "nats")]
    pub jetstream: JetStreamConfig,
    /// AMQP-specific configuration.
    #[cfg(feature = "amqp")]
    pub amqp: AmqpConfig,
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker adapter based on configuration.
///
/// Requires the corresponding feature for external transports:
/// - Kafka: `--features kafka`
/// - NATS / JetStream: `--features nats` (included in default)
/// - AMQP: `--features amqp` (included in default)
pub async fn init_broker(
    config: &BrokerConfig,
) -> std::result::Result<Arc<dyn BrokerController>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type {
        BrokerType::Memory => {
            info!(broker_type = "memory", "Broker initialized");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        BrokerType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let broker = KafkaBroker::new(config.kafka.clone()).await?;
                info!(broker_type = "kafka", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err("Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                    .into())
            }
        }
        BrokerType::Nats => {
            #[cfg(feature = "nats")]
            {
                let broker = NatsBroker::new(config.nats.clone()).await?;
                info!(broker_type = "nats", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err("NATS support requires the 'nats' feature. Rebuild with --features nats".into())
            }
        }
        BrokerType::Jetstream => {
            #[cfg(feature = "nats")]
            {
                let broker = JetStreamBroker::new(config.jetstream.clone()).await?;
                info!(broker_type = "jetstream", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err("JetStream support requires the 'nats' feature. Rebuild with --features nats"
                    .into())
            }
        }
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::new(config.amqp.clone()).await?;
                info!(broker_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}
