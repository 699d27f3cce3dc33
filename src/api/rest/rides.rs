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

use crate::error::AppError;
use crate::models::chair::Coordinate;
use crate::models::principal::RiderPrincipal;
use crate::models::ride::{Ride, RideStatus};
use crate::models::settlement::FareSettlement;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides", post(create_ride))
        .route("/rides/:id", get(get_ride))
        .route("/rides/:id/cancel", post(cancel_ride))
        .route("/rides/:id/settle", post(settle_ride))
}

#[derive(Deserialize)]
pub struct CreateRideRequest {
    pub pickup: Coordinate,
    pub destination: Coordinate,
}

#[derive(Serialize)]
pub struct RideView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub chair_id: Option<Uuid>,
    pub pickup: Coordinate,
    pub destination: Coordinate,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn ride_view(state: &AppState, ride_id: Uuid) -> Result<RideView, AppError> {
    let ride = state
        .store
        .ride(ride_id)
        .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))?;
    let status = state.rides.current_status(ride_id)?;

    Ok(RideView {
        id: ride.id,
        user_id: ride.user_id,
        chair_id: ride.chair_id,
        pickup: ride.pickup,
        destination: ride.destination,
        status,
        created_at: ride.created_at,
        updated_at: ride.updated_at,
    })
}

async fn create_ride(
    State(state): State<Arc<AppState>>,
    rider: RiderPrincipal,
    Json(payload): Json<CreateRideRequest>,
) -> Result<(StatusCode, Json<RideView>), AppError> {
    if payload.pickup == payload.destination {
        return Err(AppError::BadRequest(
            "pickup and destination must differ".to_string(),
        ));
    }

    let ride = state
        .store
        .insert_ride(Ride::new(rider.user_id, payload.pickup, payload.destination));
    info!(ride_id = %ride.id, user_id = %rider.user_id, "ride requested");

    Ok((StatusCode::CREATED, Json(ride_view(&state, ride.id)?)))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(ride_view(&state, ride_id)?))
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    rider: RiderPrincipal,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<RideView>, AppError> {
    state.rides.cancel(ride_id, &rider).await?;
    Ok(Json(ride_view(&state, ride_id)?))
}

async fn settle_ride(
    State(state): State<Arc<AppState>>,
    rider: RiderPrincipal,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<FareSettlement>, AppError> {
    let settlement = state.settlement.settle(ride_id, &rider).await?;
    Ok(Json(settlement))
}
