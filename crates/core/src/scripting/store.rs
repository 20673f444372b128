//! Collaborator interfaces consumed by the execution orchestrator.
//!
//! The engine owns neither script storage nor history storage. It talks to
//! both through these traits; `scriptbox-db` implements them on PostgreSQL
//! and [`super::memory`] implements them in memory.

use async_trait::async_trait;
use serde::Serialize;

use crate::script_types::{ScriptDefinition, TriggerEvent};
use crate::types::EntityId;

use super::status::ExecutionRecord;

/// Failure reported by a collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("stored data is invalid: {0}")]
    Corrupt(String),
}

/// Read-only access to script definitions (the trigger matcher).
#[async_trait]
pub trait ScriptRegistry: Send + Sync {
    /// Look up one script regardless of its active flag.
    async fn find_script_by_id(&self, id: EntityId)
        -> Result<Option<ScriptDefinition>, StoreError>;

    /// Active scripts for `(tenant, event, entity)`, in the order they must
    /// run.
    async fn find_active_scripts(
        &self,
        tenant_id: EntityId,
        event: TriggerEvent,
        entity_name: &str,
    ) -> Result<Vec<ScriptDefinition>, StoreError>;
}

/// Persistence for execution records.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert or replace the record with `record.id`.
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Records for one script, newest first.
    async fn list_for_script(
        &self,
        script_id: EntityId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Terminal-status counts and mean successful duration for one script.
    async fn stats_for_script(&self, script_id: EntityId) -> Result<ExecutionStats, StoreError>;
}

/// Aggregate outcome counts for one script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub script_id: EntityId,
    pub success_count: i64,
    pub failed_count: i64,
    pub timeout_count: i64,
    /// Mean duration of SUCCESS runs; 0 when there are none.
    pub avg_execution_time_ms: f64,
}
