use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use axum::Router;

use crate::engine::dispatch::DispatchOutcome;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/internal/matching", get(trigger_matching))
}

/// Runs one dispatch pass on demand. 204 when nothing was matched.
async fn trigger_matching(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    match state.dispatcher.run_once().await? {
        DispatchOutcome::Assigned(assignment) => Ok(Json(assignment).into_response()),
        DispatchOutcome::NoRidePending | DispatchOutcome::NoChairAvailable => {
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}
