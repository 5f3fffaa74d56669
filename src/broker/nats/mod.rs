//! NATS core broker adapter.
//!
//! Fire-and-forget semantics: no persistence and no message-level
//! acknowledgment, so delivered messages carry no acknowledgment capability.
//! Subscriptions use a queue group when one is configured, giving
//! load-balanced delivery across instances.

use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use super::{BrokerController, BrokerError, Result};
use crate::message::{AcknowledgeableBrokerMessage, BrokerMessage};
use crate::subscription::{subscription_pair, Subscription, DEFAULT_CAPACITY};

/// Configuration for the NATS core adapter.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Queue group for load-balanced delivery. Empty disables queueing and
    /// every subscriber receives every message.
    pub queue_group: String,
    /// Connection name reported to the server.
    pub connection_name: String,
    /// Path to a credentials file (optional, for authenticated clusters).
    pub credentials_path: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            queue_group: String::new(),
            connection_name: "polybus".to_string(),
            credentials_path: None,
        }
    }
}

impl NatsConfig {
    /// Create a config for the given server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the queue group for load-balanced delivery.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = group.into();
        self
    }

    /// Set the connection name reported to the server.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    /// Use a credentials file for authentication.
    pub fn with_credentials(mut self, path: impl Into<String>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }
}

/// Connect to NATS with the configured options.
pub(crate) async fn connect(
    url: &str,
    connection_name: &str,
    credentials_path: Option<&str>,
) -> Result<async_nats::Client> {
    let mut options = ConnectOptions::new().name(connection_name);

    if let Some(path) = credentials_path {
        options = options
            .credentials_file(path)
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to load credentials: {}", e)))?;
    }

    options
        .connect(url)
        .await
        .map_err(|e| BrokerError::Connection(format!("Failed to connect to NATS: {}", e)))
}

pub(crate) fn to_nats_headers(message: &BrokerMessage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in &message.headers {
        // NATS headers are text. Values that arrived as valid UTF-8 round
        // trip exactly; anything else is carried lossily.
        headers.insert(key.as_str(), String::from_utf8_lossy(value).as_ref());
    }
    headers
}

pub(crate) fn from_nats_headers(headers: Option<&HeaderMap>, payload: &[u8]) -> BrokerMessage {
    let mut message = BrokerMessage::new(payload.to_vec());
    if let Some(headers) = headers {
        for (key, values) in headers.iter() {
            if let Some(value) = values.first() {
                message
                    .headers
                    .insert(key.to_string(), value.as_str().as_bytes().to_vec());
            }
        }
    }
    message
}

/// NATS core broker adapter.
pub struct NatsBroker {
    client: async_nats::Client,
    config: NatsConfig,
}

impl NatsBroker {
    /// Connect to NATS and create the adapter.
    pub async fn new(config: NatsConfig) -> Result<Self> {
        let client = connect(
            &config.url,
            &config.connection_name,
            config.credentials_path.as_deref(),
        )
        .await?;

        info!(url = %config.url, "Connected to NATS");
        Ok(Self { client, config })
    }
}

#[async_trait]
impl BrokerController for NatsBroker {
    async fn publish(&self, channel: &str, message: BrokerMessage) -> Result<()> {
        let headers = to_nats_headers(&message);

        self.client
            .publish_with_headers(channel.to_string(), headers, message.payload.into())
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish to '{}': {}", channel, e)))?;

        // Core NATS publishes are buffered client-side; flush so the
        // message is on the wire before reporting success.
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to flush: {}", e)))?;

        debug!(subject = %channel, "Published message to NATS");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut subscriber = if self.config.queue_group.is_empty() {
            self.client.subscribe(channel.to_string()).await
        } else {
            self.client
                .queue_subscribe(channel.to_string(), self.config.queue_group.clone())
                .await
        }
        .map_err(|e| BrokerError::Subscribe(format!("Failed to subscribe to '{}': {}", channel, e)))?;

        let (subscription, mut sender) = subscription_pair(channel, DEFAULT_CAPACITY);
        let channel = channel.to_string();

        tokio::spawn(async move {
            let done = loop {
                tokio::select! {
                    done = sender.cancel_requested() => break done,
                    item = subscriber.next() => match item {
                        Some(native) => {
                            let message =
                                from_nats_headers(native.headers.as_ref(), &native.payload);
                            if !sender
                                .transmit(AcknowledgeableBrokerMessage::new(message))
                                .await
                            {
                                break None;
                            }
                        }
                        None => break None,
                    }
                }
            };

            let _ = subscriber.unsubscribe().await;
            debug!(subject = %channel, "NATS subscription closed");
            sender.confirm_cancel(done);
        });

        Ok(subscription)
    }

    async fn close(&self) {
        let _ = self.client.flush().await;
    }
}
