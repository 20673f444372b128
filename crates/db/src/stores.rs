//! PostgreSQL implementations of the engine's collaborator traits.

use async_trait::async_trait;
use scriptbox_core::error::CoreError;
use scriptbox_core::script_types::{ScriptDefinition, TriggerEvent};
use scriptbox_core::scripting::status::ExecutionRecord;
use scriptbox_core::scripting::store::{ExecutionStats, HistoryStore, ScriptRegistry, StoreError};
use scriptbox_core::types::EntityId;

use crate::repositories::{ScriptExecutionRepo, ScriptRepo};
use crate::DbPool;

fn query_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}

fn corrupt(err: CoreError) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgScriptRegistry {
    pool: DbPool,
}

impl PgScriptRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScriptRegistry for PgScriptRegistry {
    async fn find_script_by_id(
        &self,
        id: EntityId,
    ) -> Result<Option<ScriptDefinition>, StoreError> {
        ScriptRepo::find_by_id(&self.pool, id)
            .await
            .map_err(query_error)?
            .map(ScriptDefinition::try_from)
            .transpose()
            .map_err(corrupt)
    }

    async fn find_active_scripts(
        &self,
        tenant_id: EntityId,
        event: TriggerEvent,
        entity_name: &str,
    ) -> Result<Vec<ScriptDefinition>, StoreError> {
        ScriptRepo::find_active(&self.pool, tenant_id, event, entity_name)
            .await
            .map_err(query_error)?
            .into_iter()
            .map(ScriptDefinition::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(corrupt)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: DbPool,
}

impl PgHistoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let written = ScriptExecutionRepo::upsert(&self.pool, record)
            .await
            .map_err(query_error)?;
        if !written {
            tracing::warn!(
                execution_id = %record.id,
                status = %record.status,
                "Execution already terminal; update ignored"
            );
        }
        Ok(())
    }

    async fn list_for_script(
        &self,
        script_id: EntityId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        ScriptExecutionRepo::list_by_script(&self.pool, script_id, limit, offset)
            .await
            .map_err(query_error)?
            .into_iter()
            .map(ExecutionRecord::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(corrupt)
    }

    async fn stats_for_script(&self, script_id: EntityId) -> Result<ExecutionStats, StoreError> {
        ScriptExecutionRepo::stats_by_script(&self.pool, script_id)
            .await
            .map(|row| row.into_stats(script_id))
            .map_err(query_error)
    }
}
