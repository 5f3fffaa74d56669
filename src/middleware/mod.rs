//! Continuation-passing middleware pipeline.
//!
//! A chain wraps a terminal operation (the actual publish, or the message
//! handler) in an ordered list of middleware. Each middleware receives the
//! message and a [`Next`] continuation; it may run code before and after
//! `next.run(..)`, mutate the message, or short-circuit by returning an
//! error without calling the continuation.
//!
//! A middleware that returns `Ok(())` without invoking its continuation
//! does not silently swallow the operation: the executor detects the
//! skipped call and runs the continuation itself. Short-circuiting is
//! therefore always explicit, via an `Err`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::broker::Result;
use crate::message::BrokerMessage;

pub mod logging;
pub mod recovery;

pub use logging::LoggingMiddleware;
pub use recovery::RecoveryMiddleware;

/// Which half of the pipeline a chain invocation belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound: wrapping a publish.
    Publish,
    /// Inbound: wrapping handler dispatch.
    Receive,
}

/// Invocation context handed to every middleware in a chain run.
#[derive(Clone, Debug)]
pub struct MiddlewareContext {
    /// Channel the operation targets.
    pub channel: String,
    /// Pipeline direction.
    pub direction: Direction,
}

/// One layer of the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &MiddlewareContext,
        message: &mut BrokerMessage,
        next: Next<'_>,
    ) -> Result<()>;
}

/// The operation at the end of a chain.
pub trait Terminal: Send + Sync {
    fn call<'a>(
        &'a self,
        ctx: &'a MiddlewareContext,
        message: &'a mut BrokerMessage,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Continuation representing the rest of a chain run.
///
/// Consumed by value, so a middleware cannot invoke the downstream chain
/// twice.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Terminal,
    invoked: &'a AtomicBool,
}

impl<'a> Next<'a> {
    /// Run the remainder of the chain.
    pub fn run<'b>(
        self,
        ctx: &'b MiddlewareContext,
        message: &'b mut BrokerMessage,
    ) -> BoxFuture<'b, Result<()>>
    where
        'a: 'b,
    {
        self.invoked.store(true, Ordering::SeqCst);
        Box::pin(async move {
            match self.rest.split_first() {
                None => self.terminal.call(ctx, message).await,
                Some((current, rest)) => {
                    let invoked = AtomicBool::new(false);
                    let next = Next {
                        rest,
                        terminal: self.terminal,
                        invoked: &invoked,
                    };
                    current.handle(ctx, message, next).await?;
                    if !invoked.load(Ordering::SeqCst) {
                        // The middleware returned Ok without delegating.
                        // Run the rest of the chain for it.
                        let fallback = Next {
                            rest,
                            terminal: self.terminal,
                            invoked: &invoked,
                        };
                        fallback.run(ctx, message).await?;
                    }
                    Ok(())
                }
            }
        })
    }
}

/// Ordered middleware list applied around a [`Terminal`].
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. Layers run in insertion order, outermost first.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run the chain around `terminal`.
    pub async fn run(
        &self,
        ctx: &MiddlewareContext,
        message: &mut BrokerMessage,
        terminal: &dyn Terminal,
    ) -> Result<()> {
        let invoked = AtomicBool::new(false);
        let next = Next {
            rest: &self.layers,
            terminal,
            invoked: &invoked,
        };
        next.run(ctx, message).await
    }
}
