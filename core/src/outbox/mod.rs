//! Transactional Outbox Store (C3, storage half). The relay (`crate::relay`)
//! owns the claim/publish/retry loop built on top of this store.
//!
//! Grounded on `ar-rs::events::outbox` / `subscriptions::outbox`'s
//! enqueue-then-poll shape, generalized from "poll unpublished rows" to the
//! claim-lease model spec §4.2 requires (`SELECT ... FOR UPDATE SKIP
//! LOCKED`, stuck-claim reclaim, exponential backoff) — none of which the
//! simpler teacher outbox implementations needed, since they run a single
//! publisher per module rather than a worker pool.

pub mod backoff;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::OutboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxCategory {
    Command,
    Reply,
    Event,
}

impl OutboxCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxCategory::Command => "command",
            OutboxCategory::Reply => "reply",
            OutboxCategory::Event => "event",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "command" => OutboxCategory::Command,
            "reply" => OutboxCategory::Reply,
            "event" => OutboxCategory::Event,
            other => unreachable!("unknown outbox category in storage: {other}"),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxMessage {
    pub id: i64,
    pub category: String,
    pub topic: String,
    pub key: String,
    #[sqlx(rename = "type")]
    pub type_: String,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub next_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn category(&self) -> OutboxCategory {
        OutboxCategory::from_str(&self.category)
    }

    pub fn headers_map(&self) -> HashMap<String, String> {
        serde_json::from_value(self.headers.clone()).unwrap_or_default()
    }
}

/// A row not yet persisted; produced by whichever component is enqueuing
/// it (command bus, worker runtime, process manager).
pub struct NewOutboxMessage {
    pub category: OutboxCategory,
    pub topic: String,
    pub key: String,
    pub type_: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
}

#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a row inside the caller's transaction — producers must insert
    /// inside the same DB transaction as their domain write (spec §3
    /// ownership note). Returns the new row id so the caller can register a
    /// fast-path notification (spec §4.2) once the transaction commits.
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: NewOutboxMessage,
    ) -> Result<i64, OutboxError> {
        let headers = serde_json::to_value(&message.headers)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox
                (category, topic, key, type, payload, headers, status, attempts, next_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'NEW', 0, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(message.category.as_str())
        .bind(&message.topic)
        .bind(&message.key)
        .bind(&message.type_)
        .bind(&message.payload)
        .bind(&headers)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Sweep claim (spec §4.2 step 1): claim up to `batch_size` rows that are
    /// either NEW and due, or CLAIMED and stuck past `claim_timeout`. Uses
    /// `FOR UPDATE SKIP LOCKED` so concurrent relay workers never contend
    /// for the same row (spec §5's one hard serialization point).
    pub async fn claim_batch(
        &self,
        worker_id: &str,
        batch_size: i64,
        claim_timeout: chrono::Duration,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let mut tx = self.pool.begin().await?;

        let stuck_before = Utc::now() - claim_timeout;
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM outbox
            WHERE (status = 'NEW' AND next_at <= NOW())
               OR (status = 'CLAIMED' AND next_at <= $2)
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch_size)
        .bind(stuck_before)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let lease_until = Utc::now() + claim_timeout;
        let claimed = sqlx::query_as::<_, OutboxMessage>(
            r#"
            UPDATE outbox
            SET status = 'CLAIMED', claimed_by = $2, next_at = $3
            WHERE id = ANY($1)
            RETURNING *
            "#,
        )
        .bind(&ids)
        .bind(worker_id)
        .bind(lease_until)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(claimed)
    }

    /// Fast-path claim (spec §4.2): identical claim semantics, but scoped to
    /// a single known row id. Returns `None` (not an error) if another
    /// worker already holds a non-expired claim — the sweep loop will
    /// eventually pick it up, so losing this race is harmless.
    pub async fn claim_by_id(
        &self,
        worker_id: &str,
        id: i64,
        claim_timeout: chrono::Duration,
    ) -> Result<Option<OutboxMessage>, OutboxError> {
        let mut tx = self.pool.begin().await?;

        let stuck_before = Utc::now() - claim_timeout;
        let candidate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM outbox
            WHERE id = $1
              AND ((status = 'NEW' AND next_at <= NOW())
                OR (status = 'CLAIMED' AND next_at <= $2))
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(id)
        .bind(stuck_before)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(_) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let lease_until = Utc::now() + claim_timeout;
        let claimed = sqlx::query_as::<_, OutboxMessage>(
            r#"
            UPDATE outbox
            SET status = 'CLAIMED', claimed_by = $2, next_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease_until)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(claimed))
    }

    /// Terminal: PUBLISHED rows are immutable thereafter (spec §3 invariant c).
    pub async fn mark_published(&self, id: i64) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PUBLISHED', published_at = NOW(), claimed_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Publish failure (spec §4.2 step 4): bump attempts, compute the next
    /// backoff window, and release the claim back to NEW so either the
    /// sweep loop or another fast-path attempt can retry it.
    pub async fn mark_publish_failed(
        &self,
        id: i64,
        error_message: &str,
        max_backoff: chrono::Duration,
    ) -> Result<(), OutboxError> {
        let attempts: i32 = sqlx::query_scalar(
            "SELECT attempts FROM outbox WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        let next_attempts = attempts + 1;
        let delay = backoff::compute(next_attempts, max_backoff);
        let next_at = Utc::now() + delay;

        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'NEW', attempts = $2, next_at = $3,
                last_error = $4, claimed_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_attempts)
        .bind(next_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
