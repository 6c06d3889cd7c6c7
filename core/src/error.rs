//! Subsystem error types, one `thiserror` enum per boundary (spec §7),
//! mirroring `event_bus::BusError`'s shape.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandBusError {
    #[error("duplicate idempotency key")]
    DuplicateIdempotencyKey,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown process type: {0}")]
    UnknownProcessType(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("process instance not found for command {0}")]
    InstanceNotFound(uuid::Uuid),

    #[error("command bus error: {0}")]
    CommandBus(#[from] CommandBusError),
}

/// Fatal configuration errors (spec §7): duplicate handler registration,
/// ambiguous process type registration. These panic at startup, they are
/// never returned to a caller at runtime.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("handler already registered for command type: {0}")]
    DuplicateHandler(String),

    #[error("process configuration already registered for process type: {0}")]
    DuplicateProcessType(String),
}
