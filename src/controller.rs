//! The runtime tying a broker, a middleware chain, and message handlers
//! together.
//!
//! One [`Controller`] wraps one broker. `subscribe` attaches a handler to a
//! channel and spawns a dispatch task that runs every received message
//! through the middleware chain and the handler, acking on success and
//! naking on failure. Handler failures also flow into a bounded error
//! channel the application can drain; when it falls behind, new errors are
//! dropped rather than blocking dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerController, BrokerError, Result};
use crate::message::BrokerMessage;
use crate::middleware::{Direction, MiddlewareChain, MiddlewareContext, Terminal};
use crate::subscription::SubscriptionCanceller;

/// Default bound of the handler error channel.
pub const DEFAULT_ERROR_CAPACITY: usize = 256;

/// Application-provided message handler.
///
/// The handler receives an owned copy of the message; mutations made by
/// receive middleware are visible in it.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, channel: &str, message: BrokerMessage) -> BoxFuture<'static, Result<()>>;
}

impl<F> MessageHandler for F
where
    F: Fn(&str, BrokerMessage) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    fn handle(&self, channel: &str, message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
        self(channel, message)
    }
}

/// A handler failure surfaced on the controller's error channel.
#[derive(Debug)]
pub struct DispatchError {
    /// Channel the failing message arrived on.
    pub channel: String,
    /// The failure itself.
    pub error: BrokerError,
}

struct Live {
    canceller: SubscriptionCanceller,
    task: JoinHandle<()>,
}

/// Runtime that dispatches subscribed channels to handlers through the
/// middleware chain.
pub struct Controller {
    broker: Arc<dyn BrokerController>,
    chain: MiddlewareChain,
    subscriptions: Mutex<HashMap<String, Live>>,
    errors: std::sync::Mutex<Option<mpsc::Sender<DispatchError>>>,
    error_stream: std::sync::Mutex<Option<mpsc::Receiver<DispatchError>>>,
}

impl Controller {
    /// Create a controller with an empty middleware chain and the default
    /// error channel capacity.
    pub fn new(broker: Arc<dyn BrokerController>) -> Self {
        Self::with_error_capacity(broker, DEFAULT_ERROR_CAPACITY)
    }

    /// Create a controller with a custom error channel capacity.
    pub fn with_error_capacity(broker: Arc<dyn BrokerController>, capacity: usize) -> Self {
        let (error_tx, error_rx) = mpsc::channel(capacity);
        Self {
            broker,
            chain: MiddlewareChain::new(),
            subscriptions: Mutex::new(HashMap::new()),
            errors: std::sync::Mutex::new(Some(error_tx)),
            error_stream: std::sync::Mutex::new(Some(error_rx)),
        }
    }

    /// Set the middleware chain applied to publishes and dispatches.
    pub fn with_middleware(mut self, chain: MiddlewareChain) -> Self {
        self.chain = chain;
        self
    }

    /// Take the receiving end of the error channel. Returns `None` after
    /// the first call.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<DispatchError>> {
        self.error_stream.lock().unwrap().take()
    }

    /// Publish a message through the middleware chain.
    pub async fn publish(&self, channel: &str, mut message: BrokerMessage) -> Result<()> {
        let ctx = MiddlewareContext {
            channel: channel.to_string(),
            direction: Direction::Publish,
        };
        let terminal = PublishTerminal {
            broker: Arc::clone(&self.broker),
        };
        self.chain.run(&ctx, &mut message, &terminal).await
    }

    /// Subscribe a handler to a channel and start dispatching.
    ///
    /// At most one handler per channel per controller; a second subscribe
    /// on the same channel fails with [`BrokerError::AlreadySubscribed`].
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(channel) {
            return Err(BrokerError::AlreadySubscribed(channel.to_string()));
        }

        let subscription = self.broker.subscribe(channel).await?;
        let (mut stream, canceller) = subscription.split();

        let chain = self.chain.clone();
        let errors = self.errors.lock().unwrap().clone();
        let channel_name = channel.to_string();

        let task = tokio::spawn(async move {
            let ctx = MiddlewareContext {
                channel: channel_name.clone(),
                direction: Direction::Receive,
            };
            let terminal = HandlerTerminal { handler };

            while let Some(received) = stream.next().await {
                let mut message = received.message.clone();
                match chain.run(&ctx, &mut message, &terminal).await {
                    Ok(()) => {
                        if let Err(e) = received.ack().await {
                            warn!(channel = %channel_name, error = %e, "Ack failed");
                        }
                    }
                    Err(error) => {
                        warn!(channel = %channel_name, %error, "Handler failed");
                        if let Err(e) = received.nak().await {
                            warn!(channel = %channel_name, error = %e, "Nak failed");
                        }
                        if let Some(errors) = &errors {
                            // Drop the report rather than block dispatch
                            // when the application is not draining.
                            let _ = errors.try_send(DispatchError {
                                channel: channel_name.clone(),
                                error,
                            });
                        }
                    }
                }
            }

            debug!(channel = %channel_name, "Dispatch loop ended");
        });

        subscriptions.insert(channel.to_string(), Live { canceller, task });
        info!(channel = %channel, "Handler subscribed");
        Ok(())
    }

    /// Stop dispatching a channel. Waits until the dispatch task has fully
    /// stopped; afterwards the handler is never invoked again for this
    /// channel. No-op for a channel that is not subscribed.
    pub async fn unsubscribe(&self, channel: &str) {
        let live = self.subscriptions.lock().await.remove(channel);
        if let Some(live) = live {
            live.canceller.cancel().await;
            let _ = live.task.await;
            info!(channel = %channel, "Handler unsubscribed");
        }
    }

    /// Stop all dispatching and close the error channel. The broker itself
    /// stays open; the application owns its lifecycle.
    pub async fn close(&self) {
        let channels: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        for channel in channels {
            self.unsubscribe(&channel).await;
        }
        self.errors.lock().unwrap().take();
        info!("Controller closed");
    }
}

struct PublishTerminal {
    broker: Arc<dyn BrokerController>,
}

impl Terminal for PublishTerminal {
    fn call<'a>(
        &'a self,
        ctx: &'a MiddlewareContext,
        message: &'a mut BrokerMessage,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.broker.publish(&ctx.channel, message.clone()).await })
    }
}

struct HandlerTerminal {
    handler: Arc<dyn MessageHandler>,
}

impl Terminal for HandlerTerminal {
    fn call<'a>(
        &'a self,
        ctx: &'a MiddlewareContext,
        message: &'a mut BrokerMessage,
    ) -> BoxFuture<'a, Result<()>> {
        self.handler.handle(&ctx.channel, message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::middleware::{MiddlewareChain, RecoveryMiddleware};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
        seen: Arc<Notify>,
    }

    impl MessageHandler for CountingHandler {
        fn handle(&self, _channel: &str, _message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
            let count = Arc::clone(&self.count);
            let seen = Arc::clone(&self.seen);
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                seen.notify_one();
                Ok(())
            })
        }
    }

    struct FailingHandler;

    impl MessageHandler for FailingHandler {
        fn handle(&self, _channel: &str, _message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { Err(BrokerError::Handler("nope".to_string())) })
        }
    }

    struct PanickingHandler;

    impl MessageHandler for PanickingHandler {
        fn handle(&self, _channel: &str, _message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
            Box::pin(async { panic!("handler exploded") })
        }
    }

    #[tokio::test]
    async fn test_dispatches_to_handler() {
        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::new(broker.clone());

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Notify::new());
        controller
            .subscribe(
                "light.measured",
                Arc::new(CountingHandler {
                    count: Arc::clone(&count),
                    seen: Arc::clone(&seen),
                }),
            )
            .await
            .unwrap();

        controller
            .publish("light.measured", BrokerMessage::new(b"42".to_vec()))
            .await
            .unwrap();

        timeout(Duration::from_secs(1), seen.notified()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::new(broker);

        let handler = Arc::new(FailingHandler);
        controller
            .subscribe("light.measured", handler.clone())
            .await
            .unwrap();
        let second = controller.subscribe("light.measured", handler).await;

        assert!(matches!(second, Err(BrokerError::AlreadySubscribed(_))));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_dispatch_and_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::new(broker.clone());

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Notify::new());
        controller
            .subscribe(
                "light.measured",
                Arc::new(CountingHandler {
                    count: Arc::clone(&count),
                    seen: Arc::clone(&seen),
                }),
            )
            .await
            .unwrap();

        controller.unsubscribe("light.measured").await;
        controller.unsubscribe("light.measured").await;

        broker
            .publish("light.measured", BrokerMessage::new(b"late".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // The channel is free for a new handler.
        controller
            .subscribe(
                "light.measured",
                Arc::new(CountingHandler { count, seen }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_reaches_error_channel() {
        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::new(broker);
        let mut errors = controller.take_errors().unwrap();

        controller
            .subscribe("light.measured", Arc::new(FailingHandler))
            .await
            .unwrap();
        controller
            .publish("light.measured", BrokerMessage::new(vec![]))
            .await
            .unwrap();

        let report = timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.channel, "light.measured");
        assert!(matches!(report.error, BrokerError::Handler(_)));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::new(broker)
            .with_middleware(MiddlewareChain::new().with(Arc::new(RecoveryMiddleware::new())));
        let mut errors = controller.take_errors().unwrap();

        controller
            .subscribe("light.measured", Arc::new(PanickingHandler))
            .await
            .unwrap();

        controller
            .publish("light.measured", BrokerMessage::new(vec![]))
            .await
            .unwrap();
        let first = timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first.error, BrokerError::HandlerPanic(_)));

        // The dispatch loop survived the panic and keeps processing.
        controller
            .publish("light.measured", BrokerMessage::new(vec![]))
            .await
            .unwrap();
        let second = timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second.error, BrokerError::HandlerPanic(_)));
    }

    #[tokio::test]
    async fn test_error_channel_drops_when_full() {
        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::with_error_capacity(broker, 1);
        let mut errors = controller.take_errors().unwrap();

        controller
            .subscribe("light.measured", Arc::new(FailingHandler))
            .await
            .unwrap();

        for _ in 0..5 {
            controller
                .publish("light.measured", BrokerMessage::new(vec![]))
                .await
                .unwrap();
        }
        // Let dispatch drain the subscription; overflow reports are dropped.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(errors.recv().await.is_some());
        controller.close().await;
        // After close the sender is gone, so the stream terminates instead
        // of yielding the dropped reports.
        assert!(timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_close_leaves_broker_usable() {
        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::new(broker.clone());

        controller
            .subscribe("light.measured", Arc::new(FailingHandler))
            .await
            .unwrap();
        controller.close().await;

        // The broker still accepts operations after the controller closes.
        let mut subscription = broker.subscribe("light.measured").await.unwrap();
        broker
            .publish("light.measured", BrokerMessage::new(b"x".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            subscription.next().await.unwrap().message.payload,
            b"x"
        );
    }

    #[tokio::test]
    async fn test_publish_runs_middleware() {
        struct Stamps;

        #[async_trait::async_trait]
        impl crate::middleware::Middleware for Stamps {
            async fn handle(
                &self,
                ctx: &MiddlewareContext,
                message: &mut BrokerMessage,
                next: crate::middleware::Next<'_>,
            ) -> Result<()> {
                message.headers.insert("stamp".to_string(), b"1".to_vec());
                next.run(ctx, message).await
            }
        }

        let broker = Arc::new(InMemoryBroker::new());
        let controller = Controller::new(broker.clone())
            .with_middleware(MiddlewareChain::new().with(Arc::new(Stamps)));

        let mut subscription = broker.subscribe("light.measured").await.unwrap();
        controller
            .publish("light.measured", BrokerMessage::new(vec![]))
            .await
            .unwrap();

        let received = subscription.next().await.unwrap();
        assert!(received.message.headers.contains_key("stamp"));
    }
}
