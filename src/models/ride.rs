use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::chair::Coordinate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    New,
    Matched,
    Enroute,
    Pickup,
    Carrying,
    Arrived,
    Completed,
    Canceled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Canceled)
    }

    /// The single status that follows this one on the success path.
    pub fn successor(self) -> Option<RideStatus> {
        match self {
            RideStatus::New => Some(RideStatus::Matched),
            RideStatus::Matched => Some(RideStatus::Enroute),
            RideStatus::Enroute => Some(RideStatus::Pickup),
            RideStatus::Pickup => Some(RideStatus::Carrying),
            RideStatus::Carrying => Some(RideStatus::Arrived),
            RideStatus::Arrived => Some(RideStatus::Completed),
            RideStatus::Completed | RideStatus::Canceled => None,
        }
    }

    /// Edges of the ride lifecycle. Statuses only move forward one step at a
    /// time, and `Canceled` is reachable from every non-terminal status.
    pub fn can_transition_to(self, next: RideStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RideStatus::Canceled || self.successor() == Some(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::New => "NEW",
            RideStatus::Matched => "MATCHED",
            RideStatus::Enroute => "ENROUTE",
            RideStatus::Pickup => "PICKUP",
            RideStatus::Carrying => "CARRYING",
            RideStatus::Arrived => "ARRIVED",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub user_id: Uuid,
    pub chair_id: Option<Uuid>,
    pub pickup: Coordinate,
    pub destination: Coordinate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    pub fn new(user_id: Uuid, pickup: Coordinate, destination: Coordinate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            chair_id: None,
            pickup,
            destination,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideStatusEvent {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
    pub chair_sent_at: Option<DateTime<Utc>>,
}
