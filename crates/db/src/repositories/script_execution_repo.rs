//! Repository for the `script_executions` table.

use scriptbox_core::scripting::status::ExecutionRecord;
use scriptbox_core::types::EntityId;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::script::{ExecutionStatsRow, ScriptExecutionRow};

/// Column list for `script_executions` SELECT queries.
const COLUMNS: &str = "\
    id, script_id, script_version, tenant_id, invoker_id, \
    input_payload, output_payload, status, error_message, \
    duration_ms, started_at, completed_at";

/// Provides query operations for execution records.
pub struct ScriptExecutionRepo;

impl ScriptExecutionRepo {
    /// Insert a record, or move an existing RUNNING record to its new state.
    ///
    /// Rows that already hold a terminal status are left untouched, so a
    /// record can only be finished once. Returns `false` when nothing was
    /// written.
    pub async fn upsert(pool: &PgPool, record: &ExecutionRecord) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO script_executions (\
                id, script_id, script_version, tenant_id, invoker_id, \
                input_payload, output_payload, status, error_message, \
                duration_ms, started_at, completed_at\
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO UPDATE SET \
                output_payload = EXCLUDED.output_payload, \
                status = EXCLUDED.status, \
                error_message = EXCLUDED.error_message, \
                duration_ms = EXCLUDED.duration_ms, \
                completed_at = EXCLUDED.completed_at, \
                updated_at = now() \
             WHERE script_executions.status = 'RUNNING'",
        )
        .bind(record.id)
        .bind(record.script_id)
        .bind(record.script_version)
        .bind(record.tenant_id)
        .bind(record.invoker_id)
        .bind(Json(&record.input_payload))
        .bind(record.output_payload.as_ref().map(Json))
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(record.duration_ms)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List executions for a script, most recent first.
    pub async fn list_by_script(
        pool: &PgPool,
        script_id: EntityId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScriptExecutionRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM script_executions \
             WHERE script_id = $1 \
             ORDER BY started_at DESC, id DESC \
             LIMIT $2 OFFSET $3"
        );
        sqlx::query_as::<_, ScriptExecutionRow>(&query)
            .bind(script_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Terminal-status counts and mean SUCCESS duration for a script.
    pub async fn stats_by_script(
        pool: &PgPool,
        script_id: EntityId,
    ) -> Result<ExecutionStatsRow, sqlx::Error> {
        sqlx::query_as::<_, ExecutionStatsRow>(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'SUCCESS') AS success_count, \
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed_count, \
                COUNT(*) FILTER (WHERE status = 'TIMEOUT') AS timeout_count, \
                (AVG(duration_ms) FILTER (WHERE status = 'SUCCESS'))::float8 \
                    AS avg_execution_time_ms \
             FROM script_executions \
             WHERE script_id = $1",
        )
        .bind(script_id)
        .fetch_one(pool)
        .await
    }
}
