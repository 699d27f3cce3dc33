use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub ride_id: Uuid,
    pub chair_id: Uuid,
    pub pickup_distance: i64,
    pub estimated_travel_time: f64,
    pub assigned_at: DateTime<Utc>,
}
