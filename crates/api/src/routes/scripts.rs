//! Route definitions for script execution endpoints.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::scripts;
use crate::state::AppState;

/// Routes mounted at `/scripts`.
///
/// ```text
/// POST   /{id}/execute              -> execute_script
/// GET    /{id}/executions           -> list_executions
/// GET    /{id}/stats                -> script_stats
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/execute", post(scripts::execute_script))
        .route("/{id}/executions", get(scripts::list_executions))
        .route("/{id}/stats", get(scripts::script_stats))
}
