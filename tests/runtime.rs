//! End-to-end runtime behavior against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::timeout;

use polybus::{
    request_reply, BrokerController, BrokerError, BrokerMessage, Controller, MessageHandler,
    MiddlewareChain, RecoveryMiddleware, Result,
};
use polybus::broker::InMemoryBroker;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Collector {
    received: std::sync::Mutex<Vec<BrokerMessage>>,
    notify: Notify,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: std::sync::Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }
}

impl MessageHandler for Collector {
    fn handle(&self, _channel: &str, message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
        self.received.lock().unwrap().push(message);
        self.notify.notify_one();
        Box::pin(async { Ok(()) })
    }
}

struct AlwaysFails;

impl MessageHandler for AlwaysFails {
    fn handle(&self, _channel: &str, _message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Err(BrokerError::Handler("always fails".to_string())) })
    }
}

#[tokio::test]
async fn round_trip_preserves_headers_and_payload() {
    init_tracing();
    let broker = Arc::new(InMemoryBroker::new());
    let controller = Controller::new(broker.clone());

    let collector = Collector::new();
    controller
        .subscribe("light.measured", collector.clone())
        .await
        .unwrap();

    let message = BrokerMessage::new(b"{\"lumens\":42}".to_vec())
        .with_header("content-type", b"application/json".to_vec())
        .with_correlation_id("rt-1");
    controller
        .publish("light.measured", message.clone())
        .await
        .unwrap();

    timeout(Duration::from_secs(1), collector.notify.notified())
        .await
        .unwrap();
    let received = collector.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], message);
}

#[tokio::test]
async fn second_subscribe_on_channel_is_rejected() {
    let broker = Arc::new(InMemoryBroker::new());
    let controller = Controller::new(broker);

    controller
        .subscribe("light.measured", Collector::new())
        .await
        .unwrap();
    let second = controller.subscribe("light.measured", Collector::new()).await;

    assert!(matches!(second, Err(BrokerError::AlreadySubscribed(_))));
}

#[tokio::test]
async fn unsubscribe_stops_delivery_and_is_idempotent() {
    let broker = Arc::new(InMemoryBroker::new());
    let controller = Controller::new(broker.clone());

    let collector = Collector::new();
    controller
        .subscribe("light.measured", collector.clone())
        .await
        .unwrap();
    controller.unsubscribe("light.measured").await;
    controller.unsubscribe("light.measured").await;
    controller.unsubscribe("never.subscribed").await;

    broker
        .publish("light.measured", BrokerMessage::new(b"late".to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(collector.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn panicking_handler_surfaces_on_error_channel_and_dispatch_survives() {
    struct PanicsOnce {
        calls: AtomicUsize,
        notify: Notify,
    }

    impl MessageHandler for PanicsOnce {
        fn handle(&self, _channel: &str, _message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            self.notify.notify_one();
            Box::pin(async move {
                if first {
                    panic!("boom");
                }
                Ok(())
            })
        }
    }

    let broker = Arc::new(InMemoryBroker::new());
    let controller = Controller::new(broker)
        .with_middleware(MiddlewareChain::new().with(Arc::new(RecoveryMiddleware::new())));
    let mut errors = controller.take_errors().unwrap();

    let handler = Arc::new(PanicsOnce {
        calls: AtomicUsize::new(0),
        notify: Notify::new(),
    });
    controller
        .subscribe("light.measured", handler.clone())
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
    assert!(matches!(report.error, BrokerError::HandlerPanic(_)));

    // The same dispatch loop processes the next message.
    controller
        .publish("light.measured", BrokerMessage::new(vec![]))
        .await
        .unwrap();
    timeout(Duration::from_secs(1), async {
        while handler.calls.load(Ordering::SeqCst) < 2 {
            handler.notify.notified().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn error_channel_is_bounded_and_closes_with_controller() {
    let broker = Arc::new(InMemoryBroker::new());
    let controller = Controller::with_error_capacity(broker, 2);
    let mut errors = controller.take_errors().unwrap();

    controller
        .subscribe("light.measured", Arc::new(AlwaysFails))
        .await
        .unwrap();

    for _ in 0..10 {
        controller
            .publish("light.measured", BrokerMessage::new(vec![]))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // At most the channel capacity was retained.
    let mut retained = 0;
    controller.close().await;
    while let Some(report) = errors.recv().await {
        assert!(matches!(report.error, BrokerError::Handler(_)));
        retained += 1;
    }
    assert!(retained <= 2);
    assert!(retained >= 1);
}

#[tokio::test]
async fn controller_close_leaves_broker_open() {
    let broker = Arc::new(InMemoryBroker::new());
    let controller = Controller::new(broker.clone());

    controller
        .subscribe("light.measured", Collector::new())
        .await
        .unwrap();
    controller.close().await;

    let mut subscription = broker.subscribe("light.measured").await.unwrap();
    broker
        .publish("light.measured", BrokerMessage::new(b"still up".to_vec()))
        .await
        .unwrap();
    assert_eq!(
        subscription.next().await.unwrap().message.payload,
        b"still up"
    );
}

#[tokio::test]
async fn request_reply_round_trip_through_controller() {
    let broker = Arc::new(InMemoryBroker::new());
    let controller = Arc::new(Controller::new(broker.clone()));

    // A responder that answers every request with the payload reversed,
    // echoing the correlation ID.
    struct Responder {
        controller: Arc<Controller>,
    }

    impl MessageHandler for Responder {
        fn handle(&self, _channel: &str, message: BrokerMessage) -> BoxFuture<'static, Result<()>> {
            let controller = Arc::clone(&self.controller);
            Box::pin(async move {
                let mut payload = message.payload.clone();
                payload.reverse();
                let mut reply = BrokerMessage::new(payload);
                if let Some(id) = message.correlation_id() {
                    let id = String::from_utf8_lossy(id).into_owned();
                    reply = reply.with_correlation_id(id);
                }
                controller.publish("replies", reply).await
            })
        }
    }

    controller
        .subscribe(
            "requests",
            Arc::new(Responder {
                controller: Arc::clone(&controller),
            }),
        )
        .await
        .unwrap();

    let correlation_id = polybus::new_correlation_id();
    let request_broker = broker.clone();
    let request =
        BrokerMessage::new(b"abc".to_vec()).with_correlation_id(correlation_id.clone());

    let reply = request_reply(
        broker.clone(),
        "replies",
        Some(&correlation_id),
        std::future::pending(),
        async move { request_broker.publish("requests", request).await },
    )
    .await
    .unwrap();

    assert_eq!(reply.payload, b"cba");
    assert_eq!(reply.correlation_id(), Some(correlation_id.as_bytes()));
}
