//! Execution status, the transient [`ExecutionRequest`], and the persisted
//! [`ExecutionRecord`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{EntityId, Timestamp};
use crate::value::{Map, Value};

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of one script run.
///
/// A record starts as `Running` and moves exactly once to one of the
/// terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Timeout,
    /// Reserved for callers that abandon a run; nothing in the engine
    /// produces it today.
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(CoreError::Validation(format!(
                "Invalid execution status: '{s}'. Must be one of: RUNNING, SUCCESS, FAILED, \
                 TIMEOUT, CANCELLED"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionRequest
// ---------------------------------------------------------------------------

/// One request to run one script. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub script_id: EntityId,
    pub tenant_id: EntityId,
    pub invoker_id: Option<EntityId>,
    /// Top-level keys become script globals.
    pub input_context: Map,
    /// Per-request deadline override. `None` uses the dispatcher default.
    pub timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Persisted outcome of one script run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: EntityId,
    pub script_id: EntityId,
    pub script_version: i32,
    pub tenant_id: EntityId,
    pub invoker_id: Option<EntityId>,
    pub input_payload: Value,
    pub output_payload: Option<Value>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl ExecutionRecord {
    /// Create a fresh `Running` record for `request`.
    ///
    /// Ids are UUID v7 so records sort by creation time.
    pub fn start(request: &ExecutionRequest, script_version: i32) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            script_id: request.script_id,
            script_version,
            tenant_id: request.tenant_id,
            invoker_id: request.invoker_id,
            input_payload: Value::Object(request.input_context.clone()),
            output_payload: None,
            status: ExecutionStatus::Running,
            error_message: None,
            duration_ms: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    /// Move the record to its terminal state.
    ///
    /// Fails if the record is already terminal or if `status` is `Running`,
    /// so a record can only ever be finished once.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        output: Option<Value>,
        error_message: Option<String>,
        duration_ms: u64,
    ) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "Execution {} is already {}",
                self.id, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(CoreError::Validation(
                "Terminal status must not be RUNNING".to_string(),
            ));
        }
        self.status = status;
        self.output_payload = output;
        self.error_message = error_message;
        self.duration_ms = Some(i64::try_from(duration_ms).unwrap_or(i64::MAX));
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
