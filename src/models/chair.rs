use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub latitude: i32,
    pub longitude: i32,
}

impl Coordinate {
    pub fn new(latitude: i32, longitude: i32) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chair {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub model: String,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Distance units per unit of time. Zero means the chair cannot be ranked.
    pub speed: u32,
    /// Mirror of the distance ledger, refreshed after each position report.
    pub total_distance: i64,
    pub total_distance_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chair {
    pub fn new(owner_id: Uuid, name: String, model: String, speed: u32, access_token: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name,
            model,
            is_active: false,
            access_token,
            speed,
            total_distance: 0,
            total_distance_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChairLocation {
    pub id: Uuid,
    pub chair_id: Uuid,
    pub coordinate: Coordinate,
    pub created_at: DateTime<Utc>,
}
