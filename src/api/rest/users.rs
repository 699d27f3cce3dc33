use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::user::User;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/users", post(create_user))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub payment_token: Option<String>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub id: Uuid,
    pub access_token: String,
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    let user = state.store.insert_user(User::new(
        payload.name,
        Uuid::new_v4().simple().to_string(),
        payload.payment_token,
    ));

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            id: user.id,
            access_token: user.access_token,
        }),
    ))
}
