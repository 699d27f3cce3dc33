use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::sales::{sales_report, SalesReport};
use crate::error::AppError;
use crate::models::owner::Owner;
use crate::models::principal::OwnerPrincipal;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/owners", post(create_owner))
        .route("/owner/chairs", get(list_chairs))
        .route("/owner/sales", get(sales))
}

#[derive(Deserialize)]
pub struct CreateOwnerRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct OwnerSessionResponse {
    pub id: Uuid,
    pub access_token: String,
    pub chair_register_token: String,
}

#[derive(Serialize)]
pub struct OwnerChairView {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub total_distance: i64,
    pub total_distance_updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct OwnerChairsResponse {
    pub chairs: Vec<OwnerChairView>,
}

/// Window bounds in milliseconds since the epoch, both inclusive.
#[derive(Deserialize)]
pub struct SalesQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
}

async fn create_owner(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOwnerRequest>,
) -> Result<(StatusCode, Json<OwnerSessionResponse>), AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    let owner = state.store.insert_owner(Owner::new(
        payload.name,
        Uuid::new_v4().simple().to_string(),
        Uuid::new_v4().simple().to_string(),
    ));

    Ok((
        StatusCode::CREATED,
        Json(OwnerSessionResponse {
            id: owner.id,
            access_token: owner.access_token,
            chair_register_token: owner.chair_register_token,
        }),
    ))
}

/// The owner's chairs with the distance columns maintained by the tracker.
async fn list_chairs(
    State(state): State<Arc<AppState>>,
    owner: OwnerPrincipal,
) -> Json<OwnerChairsResponse> {
    let chairs = state
        .store
        .chairs_for_owner(owner.owner_id)
        .into_iter()
        .map(|chair| OwnerChairView {
            id: chair.id,
            name: chair.name,
            model: chair.model,
            active: chair.is_active,
            registered_at: chair.created_at,
            total_distance: chair.total_distance,
            total_distance_updated_at: chair.total_distance_updated_at,
        })
        .collect();

    Json(OwnerChairsResponse { chairs })
}

async fn sales(
    State(state): State<Arc<AppState>>,
    owner: OwnerPrincipal,
    Query(query): Query<SalesQuery>,
) -> Result<Json<SalesReport>, AppError> {
    let since = bound(query.since, DateTime::<Utc>::MIN_UTC)?;
    let until = bound(query.until, DateTime::<Utc>::MAX_UTC)?;
    if since > until {
        return Err(AppError::BadRequest("since must not be after until".to_string()));
    }

    Ok(Json(sales_report(
        &state.store,
        &state.settlement.fares(),
        owner.owner_id,
        since,
        until,
    )))
}

fn bound(millis: Option<i64>, default: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    match millis {
        None => Ok(default),
        Some(millis) => DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| AppError::BadRequest(format!("timestamp {millis} is out of range"))),
    }
}
