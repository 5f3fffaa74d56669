//! In-memory broker backed by tokio channels.
//!
//! Single-process pub/sub for tests and standalone use, with no external
//! dependencies. Exercises the full subscription cancellation protocol, so
//! runtime code behaves identically against it and a real transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::{BrokerController, BrokerError, Result};
use crate::message::{AcknowledgeableBrokerMessage, BrokerMessage};
use crate::subscription::{subscription_pair, Subscription, DEFAULT_CAPACITY};

type SenderRegistry = Mutex<HashMap<String, Vec<mpsc::Sender<AcknowledgeableBrokerMessage>>>>;

/// In-memory broker.
///
/// Publishing fans out to every live subscription on the channel. Dropping
/// the broker (or calling [`close`](BrokerController::close)) closes all
/// subscription streams.
pub struct InMemoryBroker {
    senders: Arc<SenderRegistry>,
    shutdown: watch::Sender<bool>,
    fail_on_publish: AtomicBool,
    capacity: usize,
}

impl InMemoryBroker {
    /// Create a broker with the default per-subscription capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker with a custom per-subscription channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            senders: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            fail_on_publish: AtomicBool::new(false),
            capacity,
        }
    }

    /// Make every subsequent publish fail, for error-path tests.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Number of live subscriptions on a channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.senders
            .lock()
            .await
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerController for InMemoryBroker {
    async fn publish(&self, channel: &str, message: BrokerMessage) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("simulated publish failure".to_string()));
        }

        // Snapshot the senders so delivery happens outside the lock.
        let targets = self
            .senders
            .lock()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default();

        for sender in targets {
            // A closed receiver just means that subscription is shutting down.
            let _ = sender
                .send(AcknowledgeableBrokerMessage::new(message.clone()))
                .await;
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (subscription, mut sender) = subscription_pair(channel, self.capacity);
        let tx = sender.message_sender();

        self.senders
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx.clone());

        let senders = Arc::clone(&self.senders);
        let mut shutdown = self.shutdown.subscribe();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let done = tokio::select! {
                done = sender.cancel_requested() => done,
                // Broker closed or dropped: shut the subscription down
                // without a waiting canceller.
                _ = shutdown.changed() => None,
            };

            {
                let mut registry = senders.lock().await;
                if let Some(list) = registry.get_mut(&channel) {
                    list.retain(|s| !s.same_channel(&tx));
                    if list.is_empty() {
                        registry.remove(&channel);
                    }
                }
            }
            drop(tx);

            debug!(channel = %channel, "In-memory subscription canceled");
            sender.confirm_cancel(done);
        });

        Ok(subscription)
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.senders.lock().await.clear();
    }
}
