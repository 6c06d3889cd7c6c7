//! DLQ Store (C5): append-only park for commands that failed terminally
//! (spec §3, §4.6).
//!
//! Grounded on `ar-rs::events::dlq::insert_failed_event` (insert-or-update
//! a parked row, log at `error!`), generalized from a generic failed-event
//! snapshot to the command snapshot spec §3 names. `requeue` is the
//! operational replay helper named in SPEC_FULL.md §10.6, shaped after the
//! `replay_since`/`replay_range` operational methods on
//! `SqlxOutboxRepository` in the broader outbox-pattern corpus.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::command::ReplyRouting;
use crate::command_bus::CommandBus;
use crate::error::CommandBusError;

#[derive(Debug, Clone, FromRow)]
pub struct DlqEntry {
    pub id: Uuid,
    pub command_id: Uuid,
    pub command_name: String,
    pub business_key: String,
    pub payload: serde_json::Value,
    pub failed_status: String,
    pub error_class: String,
    pub error_message: String,
    pub attempts: i32,
    pub parked_by: String,
    pub parked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DlqStore {
    pool: PgPool,
}

impl DlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn park(
        &self,
        command_id: Uuid,
        command_name: &str,
        business_key: &str,
        payload: &serde_json::Value,
        failed_status: &str,
        error_class: &str,
        error_message: &str,
        attempts: i32,
        parked_by: &str,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO dlq
                (id, command_id, command_name, business_key, payload, failed_status,
                 error_class, error_message, attempts, parked_by, parked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            "#,
        )
        .bind(id)
        .bind(command_id)
        .bind(command_name)
        .bind(business_key)
        .bind(payload)
        .bind(failed_status)
        .bind(error_class)
        .bind(error_message)
        .bind(attempts)
        .bind(parked_by)
        .execute(&self.pool)
        .await?;

        tracing::error!(
            command_id = %command_id,
            command_name = %command_name,
            error_class = %error_class,
            "Command parked in DLQ"
        );

        Ok(id)
    }

    pub async fn find_by_command(&self, command_id: Uuid) -> Result<Option<DlqEntry>, sqlx::Error> {
        sqlx::query_as::<_, DlqEntry>("SELECT * FROM dlq WHERE command_id = $1")
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<DlqEntry>, sqlx::Error> {
        sqlx::query_as::<_, DlqEntry>(
            "SELECT * FROM dlq ORDER BY parked_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Operational replay: re-submit a parked entry as a brand new PENDING
    /// command with a derived idempotency key, so an operator can retry a
    /// terminally-failed command after a fix without touching the parked
    /// row itself (it stays for audit). Goes through `CommandBus::accept`
    /// like any other intake, so the replay also gets an outbox row and a
    /// fast-path notify — a bare `insert_pending` would leave the command
    /// parked in PENDING forever, since nothing sweeps bare-PENDING rows.
    /// Not part of the normal command lifecycle — invoked from
    /// `dlq_replay_drill`.
    pub async fn requeue(&self, command_bus: &CommandBus, entry_id: Uuid) -> Result<Uuid, CommandBusError> {
        let entry = self
            .find_by_id(entry_id)
            .await?
            .ok_or_else(|| CommandBusError::InvalidRequest(format!("no dlq entry {entry_id}")))?;

        let replay_key = format!("{}:replay:{}", entry.command_id, Uuid::new_v4());

        let new_id = command_bus
            .accept(
                &entry.command_name,
                &replay_key,
                &entry.business_key,
                &entry.payload,
                ReplyRouting::default(),
            )
            .await?;

        tracing::info!(
            dlq_entry = %entry_id,
            original_command = %entry.command_id,
            replayed_command = %new_id,
            "DLQ entry requeued as new command"
        );

        Ok(new_id)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DlqEntry>, sqlx::Error> {
        sqlx::query_as::<_, DlqEntry>("SELECT * FROM dlq WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }
}
