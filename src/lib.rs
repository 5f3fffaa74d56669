//! Transport-neutral pub/sub runtime.
//!
//! One `BrokerController` contract with adapters for Kafka, NATS core,
//! NATS JetStream, RabbitMQ, and an in-memory broker; a middleware
//! pipeline around publish and dispatch; a controller runtime binding
//! handlers to channels; and correlated request/reply.
//!
//! ```no_run
//! use std::sync::Arc;
//! use polybus::broker::{BrokerController, InMemoryBroker};
//! use polybus::message::BrokerMessage;
//!
//! # async fn example() -> polybus::broker::Result<()> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let mut subscription = broker.subscribe("light.measured").await?;
//!
//! broker
//!     .publish("light.measured", BrokerMessage::new(b"42".to_vec()))
//!     .await?;
//!
//! let received = subscription.next().await.unwrap();
//! assert_eq!(received.message.payload, b"42");
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod controller;
pub mod message;
pub mod middleware;
pub mod request;
pub mod subscription;

pub use broker::{init_broker, BrokerConfig, BrokerController, BrokerError, BrokerType, Result};
pub use controller::{Controller, DispatchError, MessageHandler};
pub use message::{Acknowledgment, AcknowledgeableBrokerMessage, BrokerMessage};
pub use middleware::{
    Direction, LoggingMiddleware, Middleware, MiddlewareChain, MiddlewareContext, Next,
    RecoveryMiddleware, Terminal,
};
pub use request::{new_correlation_id, request_reply, request_reply_with_timeout};
pub use subscription::{Subscription, SubscriptionCanceller, SubscriptionStream};
