use axum::routing::post;
use axum::Router;

use crate::handlers::triggers;
use crate::state::AppState;

/// Routes mounted at `/triggers`.
///
/// ```text
/// POST   /execute                   -> execute_trigger
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/execute", post(triggers::execute_trigger))
}
