//! Event type → handler routing.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use outbox_store::OutboxEvent;
use tracing::warn;

use crate::context::HandlerContext;
use crate::error::DispatchError;

/// Handles one event type. An `Err` sends the event down the retry path.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &OutboxEvent, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// Adapts an async closure into an `EventHandler`.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(OutboxEvent, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &OutboxEvent, ctx: &HandlerContext) -> anyhow::Result<()> {
        (self.0)(event.clone(), ctx.clone()).await
    }
}

/// Handlers keyed by event type, plus the set of types that must be covered
/// before a dispatcher may start.
///
/// Built up front and moved into the dispatcher, so nothing can be
/// registered once dispatching has begun.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    expected: BTreeSet<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `event_type`.
    pub fn on<F, Fut>(self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(OutboxEvent, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event_type, Arc::new(FnHandler(handler)))
    }

    /// Register a handler object for `event_type`. Replaces any earlier one.
    pub fn register(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            warn!(event_type = %event_type, "replacing previously registered handler");
        }
        self
    }

    /// Declare an event type the registry must cover.
    pub fn expect(mut self, event_type: impl Into<String>) -> Self {
        self.expected.insert(event_type.into());
        self
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    /// Look up a handler, treating an unknown type as an error.
    pub fn resolve(&self, event_type: &str) -> Result<&Arc<dyn EventHandler>, DispatchError> {
        self.get(event_type)
            .ok_or_else(|| DispatchError::NoHandler(event_type.to_string()))
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.handlers.is_empty() {
            return Err(DispatchError::EmptyRegistry);
        }
        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|t| !self.handlers.contains_key(t.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(DispatchError::MissingHandlers(missing));
        }
        Ok(())
    }
}
