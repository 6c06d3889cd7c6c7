//! Command Store (C2) and the idempotency index (C1) it enforces via a
//! unique constraint on `idempotency_key`.
//!
//! Grounded on `ar-rs::idempotency` (insert-if-absent over a keyed row) and
//! the `FromRow`/`query_as` style used throughout `ar-rs`/`payments-rs`
//! models, generalized from an HTTP-response cache to the command lifecycle
//! described in spec §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::CommandBusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Succeeded => "SUCCEEDED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::TimedOut
        )
    }
}

/// A caller-supplied description of where the reply to a command should be
/// routed (spec §3 `reply`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplyRouting {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    /// Extra headers the caller wants echoed back on reply/event envelopes
    /// (e.g. a process instance id for the Process Manager, spec §4.5).
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Command {
    pub id: Uuid,
    pub name: String,
    pub business_key: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub status: String,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retries: i32,
    pub processing_lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reply: Option<serde_json::Value>,
    pub reply_routing: Option<serde_json::Value>,
}

impl Command {
    pub fn status(&self) -> CommandStatus {
        match self.status.as_str() {
            "PENDING" => CommandStatus::Pending,
            "RUNNING" => CommandStatus::Running,
            "SUCCEEDED" => CommandStatus::Succeeded,
            "FAILED" => CommandStatus::Failed,
            "TIMED_OUT" => CommandStatus::TimedOut,
            other => unreachable!("unknown command status in storage: {other}"),
        }
    }

    pub fn reply_routing(&self) -> ReplyRouting {
        self.reply_routing
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Durable record of each command and its lifecycle state (C2), plus the
/// idempotency uniqueness check (C1) performed against the same table —
/// per spec §3's Open Questions, these are a single canonical entity, not
/// two separately-stored structures.
#[derive(Clone)]
pub struct CommandStore {
    pool: PgPool,
}

impl CommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Invariant (a): idempotency_key is unique across active commands. The
    /// caller is expected to run this inside a transaction together with
    /// the outbox insert described in spec §4.1.
    pub async fn insert_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
        business_key: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
        reply_routing: &ReplyRouting,
    ) -> Result<Uuid, CommandBusError> {
        let existing = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM command WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await?;

        if existing.is_some() {
            return Err(CommandBusError::DuplicateIdempotencyKey);
        }

        let id = Uuid::new_v4();
        let reply_routing_json = serde_json::to_value(reply_routing)
            .map_err(|e| CommandBusError::InvalidRequest(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO command
                (id, name, business_key, payload, idempotency_key, status,
                 requested_at, updated_at, retries, reply_routing)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', NOW(), NOW(), 0, $6)
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(business_key)
        .bind(payload)
        .bind(idempotency_key)
        .bind(&reply_routing_json)
        .execute(&mut **tx)
        .await?;

        Ok(id)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Command>, sqlx::Error> {
        sqlx::query_as::<_, Command>("SELECT * FROM command WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Attempt to take a processing lease. Returns the locked row if the
    /// command is PENDING, or RUNNING with an expired lease (duplicate
    /// delivery of a message whose original worker died) — spec §4.3 step 3.
    pub async fn try_lease(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        lease_duration: chrono::Duration,
    ) -> Result<Option<Command>, sqlx::Error> {
        let row = sqlx::query_as::<_, Command>(
            "SELECT * FROM command WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(command) = row else {
            return Ok(None);
        };

        let leaseable = match command.status() {
            CommandStatus::Pending => true,
            CommandStatus::Running => command
                .processing_lease_until
                .map(|until| until <= Utc::now())
                .unwrap_or(false),
            _ => false,
        };

        if !leaseable {
            return Ok(None);
        }

        let lease_until = Utc::now() + lease_duration;
        sqlx::query(
            r#"
            UPDATE command
            SET status = 'RUNNING', processing_lease_until = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(lease_until)
        .execute(&mut **tx)
        .await?;

        Ok(Some(command))
    }

    pub async fn mark_succeeded(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        reply: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE command
            SET status = 'SUCCEEDED', processing_lease_until = NULL,
                reply = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reply)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        error_message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE command
            SET status = 'FAILED', processing_lease_until = NULL,
                last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_timed_out(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE command
            SET status = 'TIMED_OUT', processing_lease_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Transient failure: re-enter PENDING with `retries` incremented
    /// (spec §3 invariant (b)).
    pub async fn retry_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        error_message: &str,
    ) -> Result<i32, sqlx::Error> {
        let retries: i32 = sqlx::query_scalar(
            r#"
            UPDATE command
            SET status = 'PENDING', processing_lease_until = NULL,
                retries = retries + 1, last_error = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING retries
            "#,
        )
        .bind(id)
        .bind(error_message)
        .fetch_one(&mut **tx)
        .await?;
        Ok(retries)
    }

    /// Lease-expiry reclaim sweep: RUNNING commands whose lease has passed
    /// are reset to PENDING with `retries` incremented (spec §4.3).
    pub async fn reclaim_expired_leases(&self) -> Result<Vec<Command>, sqlx::Error> {
        sqlx::query_as::<_, Command>(
            r#"
            UPDATE command
            SET status = 'PENDING', processing_lease_until = NULL,
                retries = retries + 1, updated_at = NOW()
            WHERE status = 'RUNNING' AND processing_lease_until <= NOW()
            RETURNING *
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }
}
