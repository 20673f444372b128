//! Handlers for running one script and reading its execution history.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use scriptbox_core::error::CoreError;
use scriptbox_core::scripting::config::clamp_timeout_ms;
use scriptbox_core::scripting::status::{ExecutionRecord, ExecutionRequest, ExecutionStatus};
use scriptbox_core::scripting::store::ExecutionStats;
use scriptbox_core::types::EntityId;
use scriptbox_core::value::{Map, Value};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::scripting::orchestrator::ExecutionOutcome;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Request body for `POST /scripts/{id}/execute`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteScriptRequest {
    pub tenant_id: EntityId,
    /// Must be a JSON object; missing or `null` means `{}`.
    #[serde(default)]
    pub input_context: Option<Value>,
    pub invoker_id: Option<EntityId>,
    /// Per-request deadline, clamped to 1..=60000.
    pub timeout_ms: Option<u64>,
}

/// Query parameters for paginated execution history.
#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    /// Maximum number of results to return (default: 25, max: 100).
    pub limit: Option<i64>,
    /// Offset for pagination (default: 0).
    pub offset: Option<i64>,
}

/// Result of one run as seen by HTTP callers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub execution_id: EntityId,
    pub script_id: EntityId,
    pub status: ExecutionStatus,
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub logs: Vec<String>,
}

impl From<ExecutionOutcome> for ExecutionResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        let ExecutionOutcome { record, result } = outcome;
        Self {
            execution_id: record.id,
            script_id: record.script_id,
            status: record.status,
            success: result.success,
            value: result.value,
            error: result.error,
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
            logs: result.logs,
        }
    }
}

/// Unwrap a body field that must hold a JSON object.
pub(crate) fn object_field(value: Option<Value>, field: &str) -> Result<Map, CoreError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(CoreError::Validation(format!(
            "{field} must be a JSON object, got {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /scripts/{id}/execute
///
/// Run one script and return its recorded outcome. Script failures are a
/// `200` with `success: false`; only lookup and storage problems are errors.
pub async fn execute_script(
    State(state): State<AppState>,
    Path(script_id): Path<EntityId>,
    Json(input): Json<ExecuteScriptRequest>,
) -> AppResult<Json<DataResponse<ExecutionResponse>>> {
    let input_context = object_field(input.input_context, "inputContext")?;

    let outcome = state
        .orchestrator
        .execute(ExecutionRequest {
            script_id,
            tenant_id: input.tenant_id,
            invoker_id: input.invoker_id,
            input_context,
            timeout: input.timeout_ms.map(clamp_timeout_ms),
        })
        .await?;

    Ok(Json(DataResponse {
        data: outcome.into(),
    }))
}

/// GET /scripts/{id}/executions
///
/// Paginated execution history for a script, newest first.
pub async fn list_executions(
    State(state): State<AppState>,
    Path(script_id): Path<EntityId>,
    Query(params): Query<ExecutionListQuery>,
) -> AppResult<Json<DataResponse<Vec<ExecutionRecord>>>> {
    let executions = state
        .orchestrator
        .history(script_id, params.limit, params.offset)
        .await?;
    Ok(Json(DataResponse { data: executions }))
}

/// GET /scripts/{id}/stats
pub async fn script_stats(
    State(state): State<AppState>,
    Path(script_id): Path<EntityId>,
) -> AppResult<Json<DataResponse<ExecutionStats>>> {
    let stats = state.orchestrator.stats(script_id).await?;
    Ok(Json(DataResponse { data: stats }))
}
