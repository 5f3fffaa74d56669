//! Structured logging around every chain invocation.

use async_trait::async_trait;
use tracing::debug;

use super::{Direction, Middleware, MiddlewareContext, Next};
use crate::broker::Result;
use crate::message::BrokerMessage;

/// Logs each operation before and after the downstream chain runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: &MiddlewareContext,
        message: &mut BrokerMessage,
        next: Next<'_>,
    ) -> Result<()> {
        let operation = match ctx.direction {
            Direction::Publish => "publish",
            Direction::Receive => "receive",
        };

        debug!(
            channel = %ctx.channel,
            operation,
            payload_bytes = message.payload.len(),
            "Message pipeline started"
        );

        let result = next.run(ctx, message).await;

        match &result {
            Ok(()) => debug!(channel = %ctx.channel, operation, "Message pipeline completed"),
            Err(error) => {
                debug!(channel = %ctx.channel, operation, %error, "Message pipeline failed")
            }
        }

        result
    }
}
