use std::sync::Arc;

use scriptbox_core::scripting::dispatcher::ExecutionDispatcher;
use scriptbox_db::DbPool;

use crate::config::ServerConfig;
use crate::scripting::orchestrator::ScriptOrchestrator;

/// Shared application state available to all handlers via Axum's `State` extractor.
///
/// Cheaply cloneable: everything inside is reference-counted.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Runs scripts and records their history.
    pub orchestrator: Arc<ScriptOrchestrator>,
    /// Worker pool shared with the orchestrator; exposed for health reporting.
    pub dispatcher: Arc<ExecutionDispatcher>,
    /// Database pool, absent in development mode.
    pub pool: Option<DbPool>,
}
