//! Transport-neutral message envelope and the acknowledgment capability
//! attached to a received message.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::broker::Result;

/// Well-known header key carrying the correlation ID (camel-case convention).
pub const CORRELATION_ID_HEADER: &str = "correlationId";

/// Alternate correlation ID header key (snake-case convention).
pub const CORRELATION_ID_HEADER_ALT: &str = "correlation_id";

/// Wire-neutral message envelope.
///
/// Adapters translate headers and payload to and from their native
/// representations. Header insertion order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Header name to raw bytes.
    pub headers: HashMap<String, Vec<u8>>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    /// Create a message with the given payload and no headers.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            payload: payload.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the correlation ID under the camel-case well-known key.
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header(CORRELATION_ID_HEADER, id.into().into_bytes())
    }

    /// Look up the correlation ID, checking both well-known header keys.
    pub fn correlation_id(&self) -> Option<&[u8]> {
        self.headers
            .get(CORRELATION_ID_HEADER)
            .or_else(|| self.headers.get(CORRELATION_ID_HEADER_ALT))
            .map(Vec::as_slice)
    }
}

/// Acknowledgment capability of a received message.
///
/// `ack` marks the message as processed; `nak` requests redelivery
/// (with a transport-defined delay, see the JetStream adapter).
#[async_trait]
pub trait Acknowledgment: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nak(&self) -> Result<()>;
}

/// A received [`BrokerMessage`] plus its acknowledgment capability.
///
/// Transports without message-level acknowledgment (NATS core, Kafka and
/// AMQP as modeled here) attach no capability; `ack`/`nak` are then no-ops.
pub struct AcknowledgeableBrokerMessage {
    pub message: BrokerMessage,
    acknowledgment: Option<Box<dyn Acknowledgment>>,
}

impl AcknowledgeableBrokerMessage {
    /// Wrap a message with no acknowledgment capability.
    pub fn new(message: BrokerMessage) -> Self {
        Self {
            message,
            acknowledgment: None,
        }
    }

    /// Wrap a message with a transport-provided acknowledgment.
    pub fn with_acknowledgment(message: BrokerMessage, ack: Box<dyn Acknowledgment>) -> Self {
        Self {
            message,
            acknowledgment: Some(ack),
        }
    }

    /// Acknowledge successful processing. No-op without a capability.
    pub async fn ack(&self) -> Result<()> {
        match &self.acknowledgment {
            Some(ack) => ack.ack().await,
            None => Ok(()),
        }
    }

    /// Negatively acknowledge, requesting redelivery. No-op without a capability.
    pub async fn nak(&self) -> Result<()> {
        match &self.acknowledgment {
            Some(ack) => ack.nak().await,
            None => Ok(()),
        }
    }

    /// Discard the acknowledgment capability and keep the message.
    pub fn into_message(self) -> BrokerMessage {
        self.message
    }
}

impl fmt::Debug for AcknowledgeableBrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgeableBrokerMessage")
            .field("message", &self.message)
            .field("acknowledgeable", &self.acknowledgment.is_some())
            .finish()
    }
}
