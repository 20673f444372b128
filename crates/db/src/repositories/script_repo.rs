//! Repository for the `scripts` table.

use scriptbox_core::script_types::TriggerEvent;
use scriptbox_core::types::EntityId;
use sqlx::PgPool;

use crate::models::script::ScriptRow;

/// Column list for `scripts` SELECT queries.
const COLUMNS: &str = "\
    id, tenant_id, name, description, source, \
    category, trigger_event, trigger_entity, \
    is_active, version, created_at, updated_at";

/// Read-only queries over script definitions.
pub struct ScriptRepo;

impl ScriptRepo {
    /// Find a script by id, active or not.
    pub async fn find_by_id(pool: &PgPool, id: EntityId) -> Result<Option<ScriptRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM scripts WHERE id = $1");
        sqlx::query_as::<_, ScriptRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Active scripts bound to `(tenant, event, entity)`.
    ///
    /// Oldest first, ties broken by id, so a batch always runs in the same
    /// order.
    pub async fn find_active(
        pool: &PgPool,
        tenant_id: EntityId,
        event: TriggerEvent,
        entity_name: &str,
    ) -> Result<Vec<ScriptRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM scripts \
             WHERE tenant_id = $1 AND trigger_event = $2 AND trigger_entity = $3 \
               AND is_active \
             ORDER BY created_at ASC, id ASC"
        );
        sqlx::query_as::<_, ScriptRow>(&query)
            .bind(tenant_id)
            .bind(event.as_str())
            .bind(entity_name)
            .fetch_all(pool)
            .await
    }
}
