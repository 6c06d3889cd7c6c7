//! Inbox Store (C4): per-(message_id, handler) dedup marker for consumer
//! idempotency (spec §3).
//!
//! Grounded directly on `ar-rs::events::consumer::{is_event_processed,
//! mark_event_processed, process_event_idempotent}`, generalized from a
//! single `event_id` key to the spec's `(message_id, handler)` composite key
//! so one broker message can be independently deduplicated per consumer.

use sqlx::PgPool;

#[derive(Clone)]
pub struct InboxStore {
    pool: PgPool,
}

impl InboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn is_processed(&self, message_id: &str, handler: &str) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inbox WHERE message_id = $1 AND handler = $2",
        )
        .bind(message_id)
        .bind(handler)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Insert-if-absent. Returns `true` if this call inserted the marker
    /// (i.e. this is the first delivery), `false` if it already existed.
    pub async fn mark_processed(&self, message_id: &str, handler: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (message_id, handler, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (message_id, handler) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(handler)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercised against a live Postgres in the crate's `tests/` integration
    // suite; the insert-if-absent contract itself (first call wins) is
    // asserted there against `mark_processed`'s boolean return.
    #[test]
    fn handler_key_is_part_of_the_dedup_key() {
        // message_id alone is not sufficient: two handlers may each need to
        // process the same message once. This is a documentation test for
        // the composite-key contract, not a DB round trip.
        assert_ne!("worker:CreateUser", "worker:SendWelcomeEmail");
    }
}
