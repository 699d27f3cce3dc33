use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::models::chair::{Chair, Coordinate};
use crate::models::principal::ChairPrincipal;
use crate::models::ride::{Ride, RideStatus};
use crate::models::user::User;
use crate::store::Store;

pub fn seed_user(store: &Store, payment_token: &str) -> User {
    store.insert_user(User::new(
        "rider".to_string(),
        Uuid::new_v4().to_string(),
        Some(payment_token.to_string()),
    ))
}

/// An active chair with `speed`, optionally placed at `location`.
pub async fn seed_chair(store: &Store, speed: u32, location: Option<Coordinate>) -> Chair {
    let mut chair = Chair::new(
        Uuid::new_v4(),
        "chair".to_string(),
        "model".to_string(),
        speed,
        Uuid::new_v4().to_string(),
    );
    chair.is_active = true;
    let chair = store.insert_chair(chair);

    if let Some(location) = location {
        let guard = store.lock_chair(chair.id).await;
        store.insert_chair_location(&guard, location, Utc::now());
    }
    chair
}

pub fn seed_ride(
    store: &Store,
    user_id: Uuid,
    pickup: Coordinate,
    destination: Coordinate,
    minutes_ago: i64,
) -> Ride {
    let mut ride = Ride::new(user_id, pickup, destination);
    ride.created_at = Utc::now() - Duration::minutes(minutes_ago);
    ride.updated_at = ride.created_at;
    store.insert_ride(ride)
}

pub fn principal(chair: &Chair) -> ChairPrincipal {
    ChairPrincipal {
        chair_id: chair.id,
        owner_id: chair.owner_id,
    }
}

/// Assigns `chair` to `ride` and walks the status log up to `status`.
pub async fn advance_to(store: &Store, ride: &Ride, chair: &Chair, status: RideStatus) {
    let ride_guard = store.lock_ride(ride.id).await;
    {
        let chair_guard = store.lock_chair(chair.id).await;
        store.assign_chair(&ride_guard, &chair_guard).unwrap();
    }

    let mut current = RideStatus::Matched;
    while current != status {
        let next = current.successor().unwrap();
        store.append_status(&ride_guard, next).unwrap();
        current = next;
    }
}
