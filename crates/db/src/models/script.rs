//! Script and execution row models.

use scriptbox_core::error::CoreError;
use scriptbox_core::script_types::{ScriptCategory, ScriptDefinition, TriggerEvent};
use scriptbox_core::scripting::status::{ExecutionRecord, ExecutionStatus};
use scriptbox_core::scripting::store::ExecutionStats;
use scriptbox_core::types::{EntityId, Timestamp};
use scriptbox_core::value::Value;
use sqlx::types::Json;
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// A row of the `scripts` table. Enum columns are stored as text.
#[derive(Debug, Clone, FromRow)]
pub struct ScriptRow {
    pub id: EntityId,
    pub tenant_id: EntityId,
    pub name: String,
    pub description: Option<String>,
    pub source: String,
    pub category: String,
    pub trigger_event: String,
    pub trigger_entity: Option<String>,
    pub is_active: bool,
    pub version: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<ScriptRow> for ScriptDefinition {
    type Error = CoreError;

    fn try_from(row: ScriptRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            description: row.description,
            source: row.source,
            category: ScriptCategory::from_str(&row.category)?,
            trigger_event: TriggerEvent::from_str(&row.trigger_event)?,
            trigger_entity: row.trigger_entity,
            is_active: row.is_active,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Script executions
// ---------------------------------------------------------------------------

/// A row of the `script_executions` table.
#[derive(Debug, Clone, FromRow)]
pub struct ScriptExecutionRow {
    pub id: EntityId,
    pub script_id: EntityId,
    pub script_version: i32,
    pub tenant_id: EntityId,
    pub invoker_id: Option<EntityId>,
    pub input_payload: Json<Value>,
    pub output_payload: Option<Json<Value>>,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl TryFrom<ScriptExecutionRow> for ExecutionRecord {
    type Error = CoreError;

    fn try_from(row: ScriptExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            script_id: row.script_id,
            script_version: row.script_version,
            tenant_id: row.tenant_id,
            invoker_id: row.invoker_id,
            input_payload: row.input_payload.0,
            output_payload: row.output_payload.map(|json| json.0),
            status: ExecutionStatus::from_str(&row.status)?,
            error_message: row.error_message,
            duration_ms: row.duration_ms,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Aggregates for one script, straight from the stats query.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionStatsRow {
    pub success_count: i64,
    pub failed_count: i64,
    pub timeout_count: i64,
    pub avg_execution_time_ms: Option<f64>,
}

impl ExecutionStatsRow {
    pub fn into_stats(self, script_id: EntityId) -> ExecutionStats {
        ExecutionStats {
            script_id,
            success_count: self.success_count,
            failed_count: self.failed_count,
            timeout_count: self.timeout_count,
            avg_execution_time_ms: self.avg_execution_time_ms.unwrap_or(0.0),
        }
    }
}
