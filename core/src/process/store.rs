//! Process Store: sqlx-backed persistence for `ProcessInstance` rows.
//!
//! Grounded on `CommandStore`'s `FromRow`/transaction-scoped update style in
//! `crate::command`, carried over verbatim for the process table.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::instance::{HistoryEntry, PendingParallel, ProcessInstance, ProcessStatus};

#[derive(Clone)]
pub struct ProcessStore {
    pool: PgPool,
}

impl ProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        process_type: &str,
        business_key: &str,
        start_step: &str,
        initial_data: &serde_json::Value,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        let empty_history = serde_json::to_value(Vec::<HistoryEntry>::new()).unwrap();
        let empty_completed: Vec<String> = Vec::new();

        sqlx::query(
            r#"
            INSERT INTO process_instance
                (id, process_type, business_key, current_step, status, data,
                 pending_parallel, history, completed_steps, current_command_id,
                 retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'RUNNING', $5, NULL, $6, $7, NULL, 0, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(process_type)
        .bind(business_key)
        .bind(start_step)
        .bind(initial_data)
        .bind(&empty_history)
        .bind(serde_json::to_value(&empty_completed).unwrap())
        .execute(&mut **tx)
        .await?;

        Ok(id)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<ProcessInstance>, sqlx::Error> {
        sqlx::query_as::<_, ProcessInstance>("SELECT * FROM process_instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<ProcessInstance>, sqlx::Error> {
        sqlx::query_as::<_, ProcessInstance>(
            "SELECT * FROM process_instance WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
    }

    /// Finds the process instance whose `current_step` command, or whose
    /// pending parallel branch command, matches `command_id` (spec §4.5
    /// `onReply`). Scans the JSONB `pending_parallel.branch_commands` map
    /// for parallel regions, or the dedicated `current_command_id` column
    /// for sequential (Direct/Conditional) steps.
    pub async fn find_by_command(
        &self,
        command_id: Uuid,
    ) -> Result<Option<ProcessInstance>, sqlx::Error> {
        sqlx::query_as::<_, ProcessInstance>(
            r#"
            SELECT * FROM process_instance
            WHERE current_command_id = $1
               OR (pending_parallel IS NOT NULL
                   AND EXISTS (
                       SELECT 1 FROM jsonb_each_text(pending_parallel -> 'branch_commands') AS kv(branch, cmd_id)
                       WHERE kv.cmd_id = $1::text
                   ))
            LIMIT 1
            "#,
        )
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn save(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        current_step: &str,
        status: ProcessStatus,
        data: &serde_json::Value,
        pending_parallel: Option<&PendingParallel>,
        history: &[HistoryEntry],
        completed_steps: &[String],
        current_command_id: Option<Uuid>,
        retry_count: i32,
    ) -> Result<(), sqlx::Error> {
        let pending_parallel_json = pending_parallel.map(|p| serde_json::to_value(p).unwrap());
        let history_json = serde_json::to_value(history).unwrap();
        let completed_steps_json = serde_json::to_value(completed_steps).unwrap();

        sqlx::query(
            r#"
            UPDATE process_instance
            SET current_step = $2, status = $3, data = $4, pending_parallel = $5,
                history = $6, completed_steps = $7, current_command_id = $8,
                retry_count = $9, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(current_step)
        .bind(status.as_str())
        .bind(data)
        .bind(pending_parallel_json)
        .bind(history_json)
        .bind(completed_steps_json)
        .bind(current_command_id)
        .bind(retry_count)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
