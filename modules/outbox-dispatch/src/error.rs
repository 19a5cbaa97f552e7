use outbox_store::OutboxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no handler registered for event type `{0}`")]
    NoHandler(String),

    #[error("handler registry is empty")]
    EmptyRegistry,

    #[error("no handler registered for expected event types: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),

    #[error("dispatcher task ended abnormally: {0}")]
    Crashed(String),

    #[error(transparent)]
    Store(#[from] OutboxError),
}
