//! Delivery side of the outbox.
//!
//! A [`Dispatcher`] claims due events from an [`OutboxBackend`], routes each
//! to the handler registered for its type, and reconciles the outcome:
//! SENT on success, rescheduled with exponential backoff on failure, FAILED
//! once the event's retry ceiling is exceeded. Handlers get a
//! [`HandlerContext`] whose `run_once` guards side effects against
//! redelivery.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod retry;
pub mod traits;

pub use context::HandlerContext;
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherHandle, Tick};
pub use error::DispatchError;
pub use memory::{MemoryOutbox, Reschedule};
pub use registry::{EventHandler, HandlerRegistry};
pub use retry::{RetryPolicy, Transition};
pub use traits::{IdempotencyGuard, OutboxBackend, PollingWake, Wake, WakeSource};
