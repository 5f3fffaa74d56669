//! Correlated request/reply on top of plain publish and subscribe.
//!
//! The reply subscription is established before the request is published,
//! so a fast responder cannot reply into a gap. Replies are matched by
//! correlation ID header; non-matching traffic on the reply channel is
//! ignored. The reply subscription is canceled before returning on every
//! path, success or failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::broker::{BrokerController, BrokerError, Result};
use crate::message::BrokerMessage;
use crate::subscription::Subscription;

/// Generate a fresh correlation ID.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Publish a request and wait for the correlated reply.
///
/// `publish` is the caller's request publication; it runs after the reply
/// subscription is live. With `correlation_id` set, only a reply carrying
/// that ID (under either well-known header key) matches; with `None`, the
/// first message on the reply channel is taken as the reply. `cancel`
/// aborts the wait with [`BrokerError::ContextCanceled`] when it completes.
pub async fn request_reply<C, P>(
    broker: Arc<dyn BrokerController>,
    reply_channel: &str,
    correlation_id: Option<&str>,
    cancel: C,
    publish: P,
) -> Result<BrokerMessage>
where
    C: Future<Output = ()>,
    P: Future<Output = Result<()>>,
{
    let mut subscription = broker.subscribe(reply_channel).await?;

    let result = await_reply(&mut subscription, correlation_id, cancel, publish).await;
    subscription.cancel().await;
    result
}

/// [`request_reply`] bounded by a timeout instead of a caller-supplied
/// cancel future.
pub async fn request_reply_with_timeout<P>(
    broker: Arc<dyn BrokerController>,
    reply_channel: &str,
    correlation_id: Option<&str>,
    timeout: Duration,
    publish: P,
) -> Result<BrokerMessage>
where
    P: Future<Output = Result<()>>,
{
    request_reply(
        broker,
        reply_channel,
        correlation_id,
        tokio::time::sleep(timeout),
        publish,
    )
    .await
}

async fn await_reply<C, P>(
    subscription: &mut Subscription,
    correlation_id: Option<&str>,
    cancel: C,
    publish: P,
) -> Result<BrokerMessage>
where
    C: Future<Output = ()>,
    P: Future<Output = Result<()>>,
{
    publish.await?;

    tokio::pin!(cancel);

    loop {
        tokio::select! {
            _ = &mut cancel => return Err(BrokerError::ContextCanceled),
            received = subscription.next() => {
                let Some(received) = received else {
                    return Err(BrokerError::SubscriptionCanceled);
                };

                let matches = match correlation_id {
                    Some(id) => received.message.correlation_id() == Some(id.as_bytes()),
                    None => true,
                };

                if !matches {
                    debug!(
                        channel = %subscription.channel(),
                        "Ignoring reply with non-matching correlation ID"
                    );
                    continue;
                }

                received.ack().await?;
                return Ok(received.into_message());
            }
        }
    }
}
