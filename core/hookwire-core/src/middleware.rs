//! Wrappers around the handler reduction.
//!
//! The first registered middleware is outermost. Each one receives the event
//! and a [`Next`]; `Next::run` consumes it, so the remainder of the chain can
//! be invoked at most once per middleware. Not calling it short-circuits:
//! no matched handler runs and the middleware's own decision is returned.
//!
//! ```ignore
//! struct Audit;
//!
//! impl Middleware for Audit {
//!     fn handle<'a>(&'a self, event: &'a Event, next: Next<'a>) -> BoxFuture<'a, Decision> {
//!         Box::pin(async move {
//!             let decision = next.run().await;
//!             tracing::info!(hook = %event.hook_name(), decision = decision.label(), "audit");
//!             decision
//!         })
//!     }
//! }
//! ```

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::decision::Decision;
use crate::event::Event;

pub trait Middleware: Send + Sync {
    fn handle<'a>(&'a self, event: &'a Event, next: Next<'a>) -> BoxFuture<'a, Decision>;
}

/// The innermost step of the chain.
pub(crate) trait Endpoint: Send + Sync {
    fn call<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Decision>;
}

/// The rest of the chain. Events are immutable, so `run` takes no event:
/// inner layers always see the one being dispatched.
pub struct Next<'a> {
    event: &'a Event,
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        event: &'a Event,
        chain: &'a [Arc<dyn Middleware>],
        endpoint: &'a dyn Endpoint,
    ) -> Self {
        Next {
            event,
            chain,
            endpoint,
        }
    }

    pub fn run(self) -> BoxFuture<'a, Decision> {
        match self.chain.split_first() {
            Some((outer, rest)) => outer.handle(
                self.event,
                Next {
                    event: self.event,
                    chain: rest,
                    endpoint: self.endpoint,
                },
            ),
            None => self.endpoint.call(self.event),
        }
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.chain.len())
            .finish()
    }
}
