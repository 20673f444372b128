//! Handler for firing every script bound to a domain event.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use scriptbox_core::script_types::TriggerEvent;
use scriptbox_core::types::EntityId;
use scriptbox_core::value::Value;

use crate::error::AppResult;
use crate::handlers::scripts::{object_field, ExecutionResponse};
use crate::response::DataResponse;
use crate::scripting::orchestrator::TriggerRequest;
use crate::state::AppState;

/// Request body for `POST /triggers/execute`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTriggerRequest {
    pub tenant_id: EntityId,
    /// `before-create` .. `scheduled`, or the `BEFORE_CREATE` spelling.
    pub trigger_event: String,
    pub trigger_entity: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub invoker_id: Option<EntityId>,
}

/// POST /triggers/execute
///
/// Run every active script matching the event, in order, and return one
/// result per script. Blocks until the whole batch is done.
pub async fn execute_trigger(
    State(state): State<AppState>,
    Json(input): Json<ExecuteTriggerRequest>,
) -> AppResult<Json<DataResponse<Vec<ExecutionResponse>>>> {
    let event = TriggerEvent::from_str(&input.trigger_event)?;
    let data = object_field(input.data, "data")?;

    let outcomes = state
        .orchestrator
        .execute_trigger(TriggerRequest {
            tenant_id: input.tenant_id,
            event,
            entity_name: input.trigger_entity,
            data,
            invoker_id: input.invoker_id,
        })
        .await?;

    Ok(Json(DataResponse {
        data: outcomes.into_iter().map(ExecutionResponse::from).collect(),
    }))
}
