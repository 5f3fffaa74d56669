//! Panic isolation for the dispatch pipeline.
//!
//! A panicking handler must not take down the dispatch task or the
//! runtime. This layer catches the unwind and converts it into a regular
//! error so the ordinary failure path (nak, error channel) applies.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use super::{Middleware, MiddlewareContext, Next};
use crate::broker::{BrokerError, Result};
use crate::message::BrokerMessage;

/// Converts a panic in the downstream chain into [`BrokerError::HandlerPanic`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryMiddleware;

impl RecoveryMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for RecoveryMiddleware {
    async fn handle(
        &self,
        ctx: &MiddlewareContext,
        message: &mut BrokerMessage,
        next: Next<'_>,
    ) -> Result<()> {
        match AssertUnwindSafe(next.run(ctx, message)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };

                error!(channel = %ctx.channel, reason = %reason, "Handler panicked");
                Err(BrokerError::HandlerPanic(reason))
            }
        }
    }
}
