pub mod health;
pub mod scripts;
pub mod triggers;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /scripts/{id}/execute                            run one script (POST)
/// /scripts/{id}/executions                         execution history (GET)
/// /scripts/{id}/stats                              outcome counts (GET)
///
/// /triggers/execute                                run a trigger batch (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/scripts", scripts::router())
        .nest("/triggers", triggers::router())
}
