//! In-memory [`ScriptRegistry`] and [`HistoryStore`].
//!
//! Back the API in development mode (no `DATABASE_URL`) and the tests.
//! Registry order is insertion order, which is the order triggered batches
//! run in.

use std::sync::RwLock;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::script_types::{ScriptDefinition, TriggerEvent};
use crate::types::EntityId;

use super::status::{ExecutionRecord, ExecutionStatus};
use super::store::{ExecutionStats, HistoryStore, ScriptRegistry, StoreError};

fn poisoned(what: &str) -> StoreError {
    StoreError::Unavailable(format!("{what} lock poisoned"))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryScriptRegistry {
    scripts: RwLock<IndexMap<EntityId, ScriptDefinition>>,
}

impl InMemoryScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition. Replacing keeps its original position.
    pub fn insert(&self, script: ScriptDefinition) -> Result<(), StoreError> {
        let mut scripts = self.scripts.write().map_err(|_| poisoned("registry"))?;
        scripts.insert(script.id, script);
        Ok(())
    }
}

#[async_trait]
impl ScriptRegistry for InMemoryScriptRegistry {
    async fn find_script_by_id(
        &self,
        id: EntityId,
    ) -> Result<Option<ScriptDefinition>, StoreError> {
        let scripts = self.scripts.read().map_err(|_| poisoned("registry"))?;
        Ok(scripts.get(&id).cloned())
    }

    async fn find_active_scripts(
        &self,
        tenant_id: EntityId,
        event: TriggerEvent,
        entity_name: &str,
    ) -> Result<Vec<ScriptDefinition>, StoreError> {
        let scripts = self.scripts.read().map_err(|_| poisoned("registry"))?;
        Ok(scripts
            .values()
            .filter(|script| script.matches_trigger(tenant_id, event, entity_name))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<IndexMap<EntityId, ExecutionRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of one record.
    pub fn get(&self, id: EntityId) -> Option<ExecutionRecord> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&id).cloned())
    }

    /// Every record, in first-save order.
    pub fn all(&self) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned("history"))?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_for_script(
        &self,
        script_id: EntityId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let records = self.records.read().map_err(|_| poisoned("history"))?;
        let mut matching: Vec<ExecutionRecord> = records
            .values()
            .filter(|record| record.script_id == script_id)
            .cloned()
            .collect();
        // v7 ids break ties between records started in the same instant.
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn stats_for_script(&self, script_id: EntityId) -> Result<ExecutionStats, StoreError> {
        let records = self.records.read().map_err(|_| poisoned("history"))?;
        let mut stats = ExecutionStats {
            script_id,
            ..Default::default()
        };
        let mut success_total_ms = 0i64;
        for record in records.values().filter(|r| r.script_id == script_id) {
            match record.status {
                ExecutionStatus::Success => {
                    stats.success_count += 1;
                    success_total_ms += record.duration_ms.unwrap_or(0);
                }
                ExecutionStatus::Failed => stats.failed_count += 1,
                ExecutionStatus::Timeout => stats.timeout_count += 1,
                ExecutionStatus::Running | ExecutionStatus::Cancelled => {}
            }
        }
        if stats.success_count > 0 {
            stats.avg_execution_time_ms = success_total_ms as f64 / stats.success_count as f64;
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
