use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::users::SessionResponse;
use super::ws;
use crate::error::AppError;
use crate::models::chair::{Chair, Coordinate};
use crate::models::principal::ChairPrincipal;
use crate::models::ride::RideStatus;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chairs", post(create_chair))
        .route("/chairs/activity", post(update_activity))
        .route("/chairs/coordinate", post(report_coordinate))
        .route("/chairs/notification", get(ws::notification_handler))
        .route("/chairs/rides/:id/status", post(update_ride_status))
        .route("/chairs/:id/distance", get(chair_distance))
}

#[derive(Deserialize)]
pub struct CreateChairRequest {
    /// Issued to the owner the chair is registered under.
    pub chair_register_token: String,
    pub name: String,
    pub model: String,
    pub speed: u32,
}

#[derive(Deserialize)]
pub struct ActivityRequest {
    pub is_active: bool,
}

#[derive(Serialize)]
pub struct CoordinateResponse {
    pub recorded_at: DateTime<Utc>,
    pub total_distance: i64,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: RideStatus,
}

#[derive(Serialize)]
pub struct DistanceResponse {
    pub chair_id: Uuid,
    pub total_distance: i64,
    pub total_distance_updated_at: Option<DateTime<Utc>>,
}

async fn create_chair(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateChairRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    if payload.name.trim().is_empty() || payload.model.trim().is_empty() {
        return Err(AppError::BadRequest(
            "name and model cannot be empty".to_string(),
        ));
    }

    let owner = state
        .store
        .owner_by_register_token(&payload.chair_register_token)
        .ok_or_else(|| AppError::Unauthorized("invalid chair register token".to_string()))?;

    let chair = state.store.insert_chair(Chair::new(
        owner.id,
        payload.name,
        payload.model,
        payload.speed,
        Uuid::new_v4().simple().to_string(),
    ));

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            id: chair.id,
            access_token: chair.access_token,
        }),
    ))
}

async fn update_activity(
    State(state): State<Arc<AppState>>,
    chair: ChairPrincipal,
    Json(payload): Json<ActivityRequest>,
) -> Result<StatusCode, AppError> {
    state.store.set_chair_active(chair.chair_id, payload.is_active)?;
    info!(chair_id = %chair.chair_id, is_active = payload.is_active, "chair activity changed");
    Ok(StatusCode::NO_CONTENT)
}

async fn report_coordinate(
    State(state): State<Arc<AppState>>,
    chair: ChairPrincipal,
    Json(coordinate): Json<Coordinate>,
) -> Result<Json<CoordinateResponse>, AppError> {
    let report = state.tracker.report_position(&chair, coordinate).await?;

    Ok(Json(CoordinateResponse {
        recorded_at: report.recorded_at,
        total_distance: report.total_distance,
    }))
}

async fn update_ride_status(
    State(state): State<Arc<AppState>>,
    chair: ChairPrincipal,
    Path(ride_id): Path<Uuid>,
    Json(payload): Json<StatusRequest>,
) -> Result<StatusCode, AppError> {
    state
        .rides
        .request_transition(ride_id, payload.status, &chair)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn chair_distance(
    State(state): State<Arc<AppState>>,
    Path(chair_id): Path<Uuid>,
) -> Result<Json<DistanceResponse>, AppError> {
    if state.store.chair(chair_id).is_none() {
        return Err(AppError::NotFound(format!("chair {chair_id} not found")));
    }

    let aggregate = state.ledger.total_distance(chair_id).await;
    Ok(Json(DistanceResponse {
        chair_id,
        total_distance: aggregate.total_distance,
        total_distance_updated_at: aggregate.updated_at,
    }))
}
