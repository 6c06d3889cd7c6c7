//! Command Handler Registry (C4.4, spec §4.4).
//!
//! Grounded on `modules/payments::handlers::handle_payment_collection_requested`
//! for the handler-function shape (pool + payload in, outcome out), and on
//! `event_bus::consumer_retry`'s `RetryConfig`/error-classification split for
//! `HandlerOutcome`'s Transient/Permanent distinction — the direct Rust
//! translation of spec §4.3's `PermanentException`/`TransientException`
//! vocabulary, since Rust has no checked-exception hierarchy to hang that on.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ConfigurationError;

/// What the worker runtime hands a handler: the durable command row's
/// identity plus its payload, already deserialized from JSON by the caller.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub command_id: Uuid,
    pub name: String,
    pub business_key: String,
    pub payload: serde_json::Value,
    pub retries: i32,
}

/// What a handler produces on success; stored verbatim in `command.reply`
/// and mirrored into the reply/event outbox rows (spec §4.3 step 5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommandReply {
    pub type_: String,
    pub payload: serde_json::Value,
}

impl CommandReply {
    pub fn new(type_: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            type_: type_.into(),
            payload,
        }
    }
}

/// The Permanent/Transient split spec §4.3 classifies handler failures into.
/// Transient failures are retried with backoff up to the retry policy, then
/// promoted to permanent; permanent failures fail the command immediately.
#[derive(Debug)]
pub enum HandlerOutcome {
    Success(CommandReply),
    Permanent(String),
    Transient(String),
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, pool: &PgPool, message: CommandMessage) -> HandlerOutcome;
}

/// Adapts a plain async closure/fn into a `CommandHandler`, for handlers
/// that don't need their own struct — mirrors the free-function handlers in
/// `modules/payments::handlers`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(PgPool, CommandMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, pool: &PgPool, message: CommandMessage) -> HandlerOutcome {
        (self.0)(pool.clone(), message).await
    }
}

/// Build-time/startup-time frozen map from `commandType` to handler (spec
/// §4.4). Immutable after construction so it is safely shared across worker
/// tasks without locking (spec §5 "Shared resources").
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
}

pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registering a second handler for the same command type is a fatal
    /// configuration error (spec §4.4) — returned here rather than panicking
    /// so callers can decide how to surface it at startup.
    pub fn register(
        mut self,
        command_type: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Result<Self, ConfigurationError> {
        let command_type = command_type.into();
        if self.handlers.contains_key(&command_type) {
            return Err(ConfigurationError::DuplicateHandler(command_type));
        }
        self.handlers.insert(command_type, Box::new(handler));
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    pub fn get(&self, command_type: &str) -> Option<&dyn CommandHandler> {
        self.handlers.get(command_type).map(|h| h.as_ref())
    }

    pub fn command_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysSucceeds;

    #[async_trait]
    impl CommandHandler for AlwaysSucceeds {
        async fn handle(&self, _pool: &PgPool, message: CommandMessage) -> HandlerOutcome {
            HandlerOutcome::Success(CommandReply::new(
                "Ok",
                serde_json::json!({ "command_id": message.command_id }),
            ))
        }
    }

    #[test]
    fn duplicate_registration_is_a_configuration_error() {
        let result = HandlerRegistry::builder()
            .register("CreateUser", AlwaysSucceeds)
            .unwrap()
            .register("CreateUser", AlwaysSucceeds);

        assert!(matches!(
            result,
            Err(ConfigurationError::DuplicateHandler(ref t)) if t == "CreateUser"
        ));
    }

    #[test]
    fn unregistered_type_is_absent() {
        let registry = HandlerRegistry::builder().build();
        assert!(registry.get("Unknown").is_none());
    }
}
