//! In-memory tables backing the ride lifecycle.
//!
//! Writes that must be serialized take a [`ChairGuard`] or [`RideGuard`].
//! Callers acquire every guard they need up front and then perform their
//! writes without suspending, so a cancelled request never leaves a half
//! applied change behind.
//!
//! Lock order: chair before ride when reporting positions, ride before chair
//! when dispatching (only rides without a chair are locked there), and a
//! rider's settlement lock before ride when settling or canceling.
//!
//! Lock entries are created on demand. An entry nobody holds or waits on can
//! be released at any time; the next acquisition simply creates a new one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::chair::{Chair, ChairLocation, Coordinate};
use crate::models::owner::Owner;
use crate::models::ride::{Ride, RideStatus, RideStatusEvent};
use crate::models::settlement::FareSettlement;
use crate::models::user::User;

/// Exclusive access to one chair's location history and assignment.
pub struct ChairGuard {
    chair_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl ChairGuard {
    pub fn chair_id(&self) -> Uuid {
        self.chair_id
    }
}

/// Exclusive access to one ride's status log and assignment.
pub struct RideGuard {
    ride_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl RideGuard {
    pub fn ride_id(&self) -> Uuid {
        self.ride_id
    }
}

/// Exclusive right to settle, or cancel, the rides of one rider. Held across
/// gateway calls, taken before any ride guard.
pub struct SettlementGuard {
    user_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl SettlementGuard {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

type LockTable = DashMap<Uuid, Arc<Mutex<()>>>;

async fn acquire(locks: &LockTable, id: Uuid) -> OwnedMutexGuard<()> {
    let lock = Arc::clone(&locks.entry(id).or_default());
    lock.lock_owned().await
}

/// Drops the entry for `id` when the table holds the only reference, i.e. no
/// guard is alive and no one is waiting for one.
fn release(locks: &LockTable, id: Uuid) -> bool {
    locks
        .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1)
        .is_some()
}

#[derive(Default)]
pub struct Store {
    users: DashMap<Uuid, User>,
    owners: DashMap<Uuid, Owner>,
    chairs: DashMap<Uuid, Chair>,
    chair_locations: DashMap<Uuid, Vec<ChairLocation>>,
    rides: DashMap<Uuid, Ride>,
    ride_statuses: DashMap<Uuid, Vec<RideStatusEvent>>,
    settlements: DashMap<Uuid, FareSettlement>,
    chair_locks: LockTable,
    ride_locks: LockTable,
    settlement_locks: LockTable,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_chair(&self, chair_id: Uuid) -> ChairGuard {
        ChairGuard {
            chair_id,
            _guard: acquire(&self.chair_locks, chair_id).await,
        }
    }

    pub async fn lock_ride(&self, ride_id: Uuid) -> RideGuard {
        RideGuard {
            ride_id,
            _guard: acquire(&self.ride_locks, ride_id).await,
        }
    }

    pub async fn lock_settlement(&self, user_id: Uuid) -> SettlementGuard {
        SettlementGuard {
            user_id,
            _guard: acquire(&self.settlement_locks, user_id).await,
        }
    }

    /// Forgets the ride's lock if it is idle. Returns whether it was dropped.
    pub fn release_ride_lock(&self, ride_id: Uuid) -> bool {
        release(&self.ride_locks, ride_id)
    }

    pub fn release_settlement_lock(&self, user_id: Uuid) -> bool {
        release(&self.settlement_locks, user_id)
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> (usize, usize) {
        (self.ride_locks.len(), self.settlement_locks.len())
    }

    // users

    pub fn insert_user(&self, user: User) -> User {
        self.users.insert(user.id, user.clone());
        user
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.users.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn user_by_access_token(&self, token: &str) -> Option<User> {
        self.users
            .iter()
            .find(|entry| entry.value().access_token == token)
            .map(|entry| entry.value().clone())
    }

    // owners

    pub fn insert_owner(&self, owner: Owner) -> Owner {
        self.owners.insert(owner.id, owner.clone());
        owner
    }

    pub fn owner_by_access_token(&self, token: &str) -> Option<Owner> {
        self.owners
            .iter()
            .find(|entry| entry.value().access_token == token)
            .map(|entry| entry.value().clone())
    }

    pub fn owner_by_register_token(&self, token: &str) -> Option<Owner> {
        self.owners
            .iter()
            .find(|entry| entry.value().chair_register_token == token)
            .map(|entry| entry.value().clone())
    }

    // chairs

    pub fn insert_chair(&self, chair: Chair) -> Chair {
        self.chairs.insert(chair.id, chair.clone());
        chair
    }

    pub fn chair(&self, chair_id: Uuid) -> Option<Chair> {
        self.chairs.get(&chair_id).map(|entry| entry.value().clone())
    }

    pub fn chair_by_access_token(&self, token: &str) -> Option<Chair> {
        self.chairs
            .iter()
            .find(|entry| entry.value().access_token == token)
            .map(|entry| entry.value().clone())
    }

    pub fn chairs(&self) -> Vec<Chair> {
        self.chairs
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The owner's chairs in registration order.
    pub fn chairs_for_owner(&self, owner_id: Uuid) -> Vec<Chair> {
        let mut chairs: Vec<Chair> = self
            .chairs
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();

        chairs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        chairs
    }

    pub fn set_chair_active(&self, chair_id: Uuid, is_active: bool) -> Result<Chair, AppError> {
        let mut chair = self
            .chairs
            .get_mut(&chair_id)
            .ok_or_else(|| AppError::NotFound(format!("chair {chair_id} not found")))?;

        chair.is_active = is_active;
        chair.updated_at = Utc::now();
        Ok(chair.clone())
    }

    /// Refreshes the materialized distance columns of a chair.
    pub fn update_chair_distance(
        &self,
        chair_id: Uuid,
        total_distance: i64,
        updated_at: Option<DateTime<Utc>>,
    ) {
        if let Some(mut chair) = self.chairs.get_mut(&chair_id) {
            chair.total_distance = total_distance;
            chair.total_distance_updated_at = updated_at;
        }
    }

    // chair locations

    /// Appends a position sample, keeping the history ordered by creation
    /// time. Samples with equal timestamps keep their insertion order.
    pub fn insert_chair_location(
        &self,
        guard: &ChairGuard,
        coordinate: Coordinate,
        created_at: DateTime<Utc>,
    ) -> ChairLocation {
        let location = ChairLocation {
            id: Uuid::new_v4(),
            chair_id: guard.chair_id,
            coordinate,
            created_at,
        };

        let mut history = self.chair_locations.entry(guard.chair_id).or_default();
        let position = history.partition_point(|existing| existing.created_at <= created_at);
        history.insert(position, location.clone());

        location
    }

    pub fn chair_locations(&self, chair_id: Uuid) -> Vec<ChairLocation> {
        self.chair_locations
            .get(&chair_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn latest_chair_location(&self, chair_id: Uuid) -> Option<ChairLocation> {
        self.chair_locations
            .get(&chair_id)
            .and_then(|entry| entry.value().last().cloned())
    }

    /// Samples recorded after the anchor at `anchor_index`, or `None` when the
    /// history no longer has that anchor at that position (an earlier sample
    /// was inserted out of order).
    pub fn chair_locations_after(
        &self,
        chair_id: Uuid,
        anchor: Option<Uuid>,
        anchor_index: usize,
    ) -> Option<Vec<ChairLocation>> {
        let entry = self.chair_locations.get(&chair_id);
        let history: &[ChairLocation] = match &entry {
            Some(entry) => entry.value(),
            None => &[],
        };

        match anchor {
            None if anchor_index == 0 => Some(history.to_vec()),
            None => None,
            Some(anchor_id) => {
                let at_anchor = anchor_index
                    .checked_sub(1)
                    .and_then(|index| history.get(index))?;
                if at_anchor.id != anchor_id {
                    return None;
                }
                Some(history[anchor_index..].to_vec())
            }
        }
    }

    // rides

    /// Persists a new ride together with its initial `NEW` status.
    pub fn insert_ride(&self, ride: Ride) -> Ride {
        let event = RideStatusEvent {
            id: Uuid::new_v4(),
            ride_id: ride.id,
            status: RideStatus::New,
            created_at: ride.created_at,
            chair_sent_at: None,
        };

        self.ride_statuses.insert(ride.id, vec![event]);
        self.rides.insert(ride.id, ride.clone());
        ride
    }

    pub fn ride(&self, ride_id: Uuid) -> Option<Ride> {
        self.rides.get(&ride_id).map(|entry| entry.value().clone())
    }

    /// Rides still waiting for a chair, oldest first. Rides canceled before
    /// being matched are not waiting.
    pub fn pending_rides(&self) -> Vec<Ride> {
        let mut pending: Vec<Ride> = self
            .rides
            .iter()
            .filter(|entry| entry.value().chair_id.is_none())
            .map(|entry| entry.value().clone())
            .collect();
        pending.retain(|ride| self.current_status(ride.id) == Some(RideStatus::New));

        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending
    }

    /// The ride most recently touched among those assigned to a chair.
    pub fn latest_ride_for_chair(&self, chair_id: Uuid) -> Option<Ride> {
        self.rides
            .iter()
            .filter(|entry| entry.value().chair_id == Some(chair_id))
            .map(|entry| entry.value().clone())
            .max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then(a.created_at.cmp(&b.created_at))
            })
    }

    /// Whether the chair has any ride that has not reached a terminal status.
    pub fn chair_has_active_ride(&self, chair_id: Uuid) -> bool {
        let ride_ids: Vec<Uuid> = self
            .rides
            .iter()
            .filter(|entry| entry.value().chair_id == Some(chair_id))
            .map(|entry| *entry.key())
            .collect();

        ride_ids
            .into_iter()
            .any(|ride_id| !self.current_status(ride_id).is_some_and(RideStatus::is_terminal))
    }

    /// Binds a chair to a pending ride and appends `MATCHED`.
    pub fn assign_chair(&self, ride: &RideGuard, chair: &ChairGuard) -> Result<Ride, AppError> {
        let existing = self
            .ride(ride.ride_id)
            .ok_or_else(|| AppError::NotFound(format!("ride {} not found", ride.ride_id)))?;
        if let Some(assigned) = existing.chair_id {
            return Err(AppError::Conflict(format!(
                "ride {} already assigned to chair {assigned}",
                ride.ride_id
            )));
        }

        let current = self.current_status(ride.ride_id).unwrap_or(RideStatus::New);
        if !current.can_transition_to(RideStatus::Matched) {
            return Err(AppError::InvalidTransition {
                from: current,
                to: RideStatus::Matched,
            });
        }

        if let Some(mut entry) = self.rides.get_mut(&ride.ride_id) {
            entry.chair_id = Some(chair.chair_id);
        }
        self.append_status(ride, RideStatus::Matched)?;

        self.ride(ride.ride_id)
            .ok_or_else(|| AppError::NotFound(format!("ride {} not found", ride.ride_id)))
    }

    pub fn rides_for_user(&self, user_id: Uuid) -> Vec<Ride> {
        let mut rides: Vec<Ride> = self
            .rides
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();

        rides.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rides
    }

    /// The user's rides whose latest status is `COMPLETED`, oldest first.
    pub fn completed_rides_for_user(&self, user_id: Uuid) -> Vec<Ride> {
        self.rides_for_user(user_id)
            .into_iter()
            .filter(|ride| self.current_status(ride.id) == Some(RideStatus::Completed))
            .collect()
    }

    /// Rides of the given chairs that reached `COMPLETED` within
    /// `[since, until]`, judged by the time of the completion event.
    pub fn completed_rides_for_chairs(
        &self,
        chair_ids: &[Uuid],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<Ride> {
        let candidates: Vec<Ride> = self
            .rides
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .chair_id
                    .is_some_and(|chair_id| chair_ids.contains(&chair_id))
            })
            .map(|entry| entry.value().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|ride| {
                self.ride_status_events(ride.id).iter().any(|event| {
                    event.status == RideStatus::Completed
                        && event.created_at >= since
                        && event.created_at <= until
                })
            })
            .collect()
    }

    // ride statuses

    pub fn current_status(&self, ride_id: Uuid) -> Option<RideStatus> {
        self.ride_statuses
            .get(&ride_id)
            .and_then(|entry| entry.value().last().map(|event| event.status))
    }

    pub fn ride_status_events(&self, ride_id: Uuid) -> Vec<RideStatusEvent> {
        self.ride_statuses
            .get(&ride_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Appends a status event, rejecting anything that is not an edge of the
    /// ride lifecycle relative to the current status.
    pub fn append_status(
        &self,
        ride: &RideGuard,
        status: RideStatus,
    ) -> Result<RideStatusEvent, AppError> {
        let event = {
            let mut events = self
                .ride_statuses
                .get_mut(&ride.ride_id)
                .ok_or_else(|| AppError::NotFound(format!("ride {} not found", ride.ride_id)))?;

            let current = events
                .last()
                .map(|event| event.status)
                .unwrap_or(RideStatus::New);
            if !current.can_transition_to(status) {
                return Err(AppError::InvalidTransition {
                    from: current,
                    to: status,
                });
            }

            let event = RideStatusEvent {
                id: Uuid::new_v4(),
                ride_id: ride.ride_id,
                status,
                created_at: Utc::now(),
                chair_sent_at: None,
            };
            events.push(event.clone());
            event
        };

        if let Some(mut entry) = self.rides.get_mut(&ride.ride_id) {
            entry.updated_at = event.created_at;
        }

        Ok(event)
    }

    pub fn oldest_undelivered_status(&self, ride_id: Uuid) -> Option<RideStatusEvent> {
        self.ride_statuses.get(&ride_id).and_then(|entry| {
            entry
                .value()
                .iter()
                .find(|event| event.chair_sent_at.is_none())
                .cloned()
        })
    }

    pub fn mark_status_delivered(&self, ride_id: Uuid, event_id: Uuid) {
        if let Some(mut events) = self.ride_statuses.get_mut(&ride_id) {
            if let Some(event) = events.iter_mut().find(|event| event.id == event_id) {
                event.chair_sent_at.get_or_insert_with(Utc::now);
            }
        }
    }

    // settlements

    pub fn settlement(&self, ride_id: Uuid) -> Option<FareSettlement> {
        self.settlements
            .get(&ride_id)
            .map(|entry| entry.value().clone())
    }

    /// Records a settlement of one of the guard holder's rides.
    pub fn save_settlement(
        &self,
        guard: &SettlementGuard,
        settlement: FareSettlement,
    ) -> Result<(), AppError> {
        let ride = self.ride(settlement.ride_id).ok_or_else(|| {
            AppError::NotFound(format!("ride {} not found", settlement.ride_id))
        })?;
        if ride.user_id != guard.user_id {
            return Err(AppError::Internal(format!(
                "settlement of ride {} saved under another rider's lock",
                ride.id
            )));
        }

        self.settlements.insert(settlement.ride_id, settlement);
        Ok(())
    }
}
