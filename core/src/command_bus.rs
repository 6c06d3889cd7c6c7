//! Command Bus (C6, spec §4.1): the single write path into the system.
//!
//! Grounded on `ar-rs`'s pattern of inserting a domain row and its outbox
//! row inside one transaction (idempotency check + insert + enqueue), with
//! the transaction boundary generalized to spec §4.1's five numbered steps
//! and the fast-path notify wired in via `crate::notifier` rather than
//! left implicit.

use std::collections::HashMap;

use sqlx::{Postgres, Transaction};

use crate::command::{CommandStore, ReplyRouting};
use crate::config::{Config, QueueNaming};
use crate::error::CommandBusError;
use crate::notifier::{FastPathNotifier, TxContext};
use crate::outbox::{NewOutboxMessage, OutboxCategory, OutboxStore};

/// `command_prefix + UPPERCASE(name) + queue_suffix` (spec §4.1 step 3).
pub fn command_queue_topic(naming: &QueueNaming, name: &str) -> String {
    format!(
        "{}{}{}",
        naming.command_prefix,
        name.to_uppercase(),
        naming.queue_suffix
    )
}

#[derive(Clone)]
pub struct CommandBus {
    commands: CommandStore,
    outbox: OutboxStore,
    notifier: FastPathNotifier,
    queue_naming: QueueNaming,
}

impl CommandBus {
    pub fn new(
        commands: CommandStore,
        outbox: OutboxStore,
        notifier: FastPathNotifier,
        config: &Config,
    ) -> Self {
        Self {
            commands,
            outbox,
            notifier,
            queue_naming: config.queue_naming.clone(),
        }
    }

    /// spec §4.1: accept a new command in its own transaction. Fails with
    /// `CommandBusError::DuplicateIdempotencyKey` if `idempotency_key` has
    /// already been seen — the caller should treat that as "already
    /// accepted", not as an error to surface to its own caller.
    pub async fn accept(
        &self,
        name: &str,
        idempotency_key: &str,
        business_key: &str,
        payload: &serde_json::Value,
        reply_routing: ReplyRouting,
    ) -> Result<uuid::Uuid, CommandBusError> {
        let mut tx = self.commands.pool().begin().await?;
        let (command_id, outbox_id) = self
            .accept_in_tx(&mut tx, name, idempotency_key, business_key, payload, &reply_routing)
            .await?;
        tx.commit().await?;

        self.notify(outbox_id);
        self.log_accepted(command_id, name, business_key);
        Ok(command_id)
    }

    /// Same as [`CommandBus::accept`], but performed inside a transaction
    /// the caller already holds open, so a co-located write (e.g. the
    /// Process Manager persisting its own state, spec §4.5 "Determinism")
    /// commits atomically with the command/outbox insert. The caller is
    /// responsible for committing `tx` and calling [`CommandBus::notify`]
    /// with the returned outbox id afterward.
    pub async fn accept_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
        idempotency_key: &str,
        business_key: &str,
        payload: &serde_json::Value,
        reply_routing: &ReplyRouting,
    ) -> Result<(uuid::Uuid, i64), CommandBusError> {
        let command_id = self
            .commands
            .insert_pending(tx, name, business_key, payload, idempotency_key, reply_routing)
            .await?;

        let mut headers: HashMap<String, String> = HashMap::new();
        headers.insert("commandId".to_string(), command_id.to_string());
        headers.insert("commandName".to_string(), name.to_string());
        headers.insert("businessKey".to_string(), business_key.to_string());
        if let Some(reply_to) = &reply_routing.reply_to {
            headers.insert("replyTo".to_string(), reply_to.clone());
        }
        if let Some(correlation_id) = &reply_routing.correlation_id {
            headers.insert("correlationId".to_string(), correlation_id.clone());
        }
        headers.extend(reply_routing.headers.clone());

        let topic = command_queue_topic(&self.queue_naming, name);

        let outbox_message = NewOutboxMessage {
            category: OutboxCategory::Command,
            topic,
            key: business_key.to_string(),
            type_: "CommandRequested".to_string(),
            payload: payload.clone(),
            headers,
        };

        let outbox_id = self
            .outbox
            .enqueue(tx, outbox_message)
            .await
            .map_err(|e| CommandBusError::InvalidRequest(e.to_string()))?;

        Ok((command_id, outbox_id))
    }

    /// Fires the fast-path notification for an outbox row inserted via
    /// [`CommandBus::accept_in_tx`], once the caller's transaction commits.
    pub fn notify(&self, outbox_id: i64) {
        let mut tx_ctx = TxContext::new();
        tx_ctx.after_commit_notify(outbox_id);
        tx_ctx.flush(&self.notifier);
    }

    fn log_accepted(&self, command_id: uuid::Uuid, name: &str, business_key: &str) {
        tracing::info!(
            command_id = %command_id,
            command_name = %name,
            business_key = %business_key,
            "Command accepted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_queue_topic_uses_configured_prefix_and_suffix() {
        let naming = QueueNaming {
            command_prefix: "APP.CMD.".to_string(),
            queue_suffix: ".Q".to_string(),
            reply_queue: "APP.CMD.REPLY.Q".to_string(),
        };
        assert_eq!(
            command_queue_topic(&naming, "CreateUser"),
            "APP.CMD.CREATEUSER.Q"
        );
    }
}
