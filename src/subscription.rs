//! The live registration of interest in one logical channel: a bounded
//! message stream plus a cancellation signal with a two-phase shutdown
//! handshake.
//!
//! [`subscription_pair`] creates both ends. The adapter side
//! ([`SubscriptionSender`]) feeds received messages into the stream and
//! watches for cancel requests. The consumer side ([`Subscription`]) reads
//! messages and can cancel-and-wait.
//!
//! Shutdown protocol: the canceller sends a completion probe through the
//! cancel channel and blocks on it. The adapter stops native consumption,
//! drops the message sender (closing the stream), and only then fires the
//! probe. The ordering guarantees a canceller never observes completion
//! while a delivery is still in flight.

use tokio::sync::{mpsc, oneshot};

use crate::message::AcknowledgeableBrokerMessage;

/// Default bound of the message channel. Provides backpressure before a
/// slow consumer blocks the adapter's receive task.
pub const DEFAULT_CAPACITY: usize = 64;

/// Create a linked [`Subscription`] / [`SubscriptionSender`] pair for a channel.
pub fn subscription_pair(
    channel: impl Into<String>,
    capacity: usize,
) -> (Subscription, SubscriptionSender) {
    let channel = channel.into();
    let (message_tx, message_rx) = mpsc::channel(capacity);
    let (cancel_tx, cancel_rx) = mpsc::channel(1);

    let subscription = Subscription {
        stream: SubscriptionStream {
            channel: channel.clone(),
            messages: message_rx,
        },
        canceller: SubscriptionCanceller {
            channel: channel.clone(),
            cancel: cancel_tx,
        },
    };
    let sender = SubscriptionSender {
        channel,
        messages: message_tx,
        cancel: cancel_rx,
    };

    (subscription, sender)
}

/// Consumer side of a live subscription.
pub struct Subscription {
    stream: SubscriptionStream,
    canceller: SubscriptionCanceller,
}

impl Subscription {
    /// The channel path this subscription is registered on.
    pub fn channel(&self) -> &str {
        self.stream.channel()
    }

    /// Receive the next message. Returns `None` once the adapter has
    /// closed the stream.
    pub async fn next(&mut self) -> Option<AcknowledgeableBrokerMessage> {
        self.stream.next().await
    }

    /// Cancel-and-wait. Does not return until the adapter has confirmed
    /// shutdown; after that no message is ever delivered again. A second
    /// call is a no-op.
    pub async fn cancel(&mut self) {
        self.canceller.cancel().await;
        // Discard anything still buffered so the post-cancel invariant
        // holds for this handle too.
        self.stream.messages.close();
        while self.stream.messages.try_recv().is_ok() {}
    }

    /// Split into the message stream and the cancel handle so they can be
    /// owned by different tasks (dispatch loop vs. registry).
    pub fn split(self) -> (SubscriptionStream, SubscriptionCanceller) {
        (self.stream, self.canceller)
    }
}

/// Receiving half of a split [`Subscription`].
pub struct SubscriptionStream {
    channel: String,
    messages: mpsc::Receiver<AcknowledgeableBrokerMessage>,
}

impl SubscriptionStream {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next message, `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<AcknowledgeableBrokerMessage> {
        self.messages.recv().await
    }
}

/// Cancelling half of a split [`Subscription`].
#[derive(Clone)]
pub struct SubscriptionCanceller {
    channel: String,
    cancel: mpsc::Sender<oneshot::Sender<()>>,
}

impl SubscriptionCanceller {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Request cancellation and wait for the adapter to confirm. No-op if
    /// the adapter side is already gone.
    pub async fn cancel(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cancel.send(done_tx).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

/// Adapter side of a live subscription.
pub struct SubscriptionSender {
    channel: String,
    messages: mpsc::Sender<AcknowledgeableBrokerMessage>,
    cancel: mpsc::Receiver<oneshot::Sender<()>>,
}

impl SubscriptionSender {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Deliver a message into the subscription. Blocks when the channel is
    /// full (backpressure). Returns `false` if the consumer side is gone.
    pub async fn transmit(&self, message: AcknowledgeableBrokerMessage) -> bool {
        self.messages.send(message).await.is_ok()
    }

    /// Clone of the raw message sender, for adapters that deliver from a
    /// task other than the cancel watcher (e.g. a shared publish path).
    /// All clones must be dropped before [`confirm_cancel`] for the stream
    /// to actually close.
    ///
    /// [`confirm_cancel`]: SubscriptionSender::confirm_cancel
    pub fn message_sender(&self) -> mpsc::Sender<AcknowledgeableBrokerMessage> {
        self.messages.clone()
    }

    /// Wait for a cancel request. `None` means the consumer side was
    /// dropped without an explicit cancel; the adapter should shut down
    /// regardless.
    pub async fn cancel_requested(&mut self) -> Option<oneshot::Sender<()>> {
        self.cancel.recv().await
    }

    /// Complete the two-phase shutdown: close the message stream first,
    /// then signal completion to the waiting canceller.
    pub fn confirm_cancel(self, done: Option<oneshot::Sender<()>>) {
        let SubscriptionSender {
            messages, cancel, ..
        } = self;
        drop(messages);
        if let Some(done) = done {
            let _ = done.send(());
        }
        drop(cancel);
    }
}
