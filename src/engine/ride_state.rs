use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::chair::Coordinate;
use crate::models::principal::{ChairPrincipal, RiderPrincipal};
use crate::models::ride::{Ride, RideStatus, RideStatusEvent};
use crate::observability::metrics::Metrics;
use crate::store::{RideGuard, Store};

/// Decides which status a ride moves to and who may move it there.
///
/// Chairs may only acknowledge a match (`MATCHED -> ENROUTE`) and confirm
/// boarding (`PICKUP -> CARRYING`). Pickup and arrival are derived from
/// position reports, completion from settlement, cancellation from the rider.
pub struct RideStateMachine {
    store: Arc<Store>,
    metrics: Metrics,
}

impl RideStateMachine {
    pub fn new(store: Arc<Store>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    pub fn current_status(&self, ride_id: Uuid) -> Result<RideStatus, AppError> {
        self.store
            .current_status(ride_id)
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))
    }

    pub async fn request_transition(
        &self,
        ride_id: Uuid,
        requested: RideStatus,
        actor: &ChairPrincipal,
    ) -> Result<RideStatusEvent, AppError> {
        let guard = self.store.lock_ride(ride_id).await;
        let ride = self.ride(ride_id)?;

        if ride.chair_id != Some(actor.chair_id) {
            return Err(AppError::NotAssigned(ride_id));
        }

        let current = self.current_status(ride_id)?;
        match (current, requested) {
            (RideStatus::Matched, RideStatus::Enroute)
            | (RideStatus::Pickup, RideStatus::Carrying) => {}
            _ => {
                return Err(AppError::InvalidTransition {
                    from: current,
                    to: requested,
                });
            }
        }

        let event = self.append(&guard, requested)?;
        info!(
            ride_id = %ride_id,
            chair_id = %actor.chair_id,
            status = %requested,
            "chair moved ride"
        );
        Ok(event)
    }

    /// The status a position report at `coordinate` implies, if any. Matching
    /// is exact: a coordinate one unit off does not trigger.
    pub fn automatic_transition(
        ride: &Ride,
        current: RideStatus,
        coordinate: &Coordinate,
    ) -> Option<RideStatus> {
        match current {
            RideStatus::Enroute if *coordinate == ride.pickup => Some(RideStatus::Pickup),
            RideStatus::Carrying if *coordinate == ride.destination => Some(RideStatus::Arrived),
            _ => None,
        }
    }

    pub fn apply_position_locked(
        &self,
        guard: &RideGuard,
        coordinate: &Coordinate,
    ) -> Result<Option<RideStatusEvent>, AppError> {
        let ride = self.ride(guard.ride_id())?;
        let current = self.current_status(ride.id)?;

        let Some(next) = Self::automatic_transition(&ride, current, coordinate) else {
            return Ok(None);
        };

        let event = self.append(guard, next)?;
        info!(ride_id = %ride.id, status = %next, "position report moved ride");
        Ok(Some(event))
    }

    /// Appends `COMPLETED`; only an `ARRIVED` ride can complete.
    pub fn complete_locked(&self, guard: &RideGuard) -> Result<RideStatusEvent, AppError> {
        let current = self.current_status(guard.ride_id())?;
        if current != RideStatus::Arrived {
            return Err(AppError::InvalidTransition {
                from: current,
                to: RideStatus::Completed,
            });
        }

        self.append(guard, RideStatus::Completed)
    }

    /// Cancels a ride on the rider's behalf. Waits for any settlement the
    /// rider has in flight, and refuses once this ride's settlement has been
    /// started: the gateway may already have charged it.
    pub async fn cancel(
        &self,
        ride_id: Uuid,
        requester: &RiderPrincipal,
    ) -> Result<RideStatusEvent, AppError> {
        let ride = self.ride(ride_id)?;
        if ride.user_id != requester.user_id {
            return Err(AppError::Unauthorized(format!(
                "ride {ride_id} belongs to another user"
            )));
        }

        let result = {
            let _settlement_guard = self.store.lock_settlement(ride.user_id).await;
            let guard = self.store.lock_ride(ride_id).await;

            if self.store.settlement(ride_id).is_some() {
                Err(AppError::Conflict(format!(
                    "ride {ride_id} is being settled and cannot be canceled"
                )))
            } else {
                self.append(&guard, RideStatus::Canceled)
            }
        };

        self.store.release_settlement_lock(ride.user_id);
        if result.is_ok() {
            self.store.release_ride_lock(ride_id);
            info!(ride_id = %ride_id, "ride canceled");
        }
        result
    }

    fn ride(&self, ride_id: Uuid) -> Result<Ride, AppError> {
        self.store
            .ride(ride_id)
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))
    }

    fn append(&self, guard: &RideGuard, status: RideStatus) -> Result<RideStatusEvent, AppError> {
        let event = self.store.append_status(guard, status)?;
        self.metrics
            .ride_status_transitions_total
            .with_label_values(&[status.as_str()])
            .inc();
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::RideStateMachine;
    use crate::error::AppError;
    use crate::models::chair::Coordinate;
    use crate::models::principal::RiderPrincipal;
    use crate::models::ride::RideStatus;
    use crate::models::settlement::FareSettlement;
    use crate::observability::metrics::Metrics;
    use crate::store::Store;
    use crate::test_support::{advance_to, principal, seed_chair, seed_ride};

    fn setup() -> (Arc<Store>, RideStateMachine) {
        let store = Arc::new(Store::new());
        let machine = RideStateMachine::new(store.clone(), Metrics::new());
        (store, machine)
    }

    fn pickup() -> Coordinate {
        Coordinate::new(10, 10)
    }

    fn destination() -> Coordinate {
        Coordinate::new(20, 30)
    }

    #[tokio::test]
    async fn assigned_chair_acknowledges_match() {
        let (store, machine) = setup();
        let chair = seed_chair(&store, 5, None).await;
        let ride = seed_ride(&store, Uuid::new_v4(), pickup(), destination(), 0);
        advance_to(&store, &ride, &chair, RideStatus::Matched).await;

        let event = machine
            .request_transition(ride.id, RideStatus::Enroute, &principal(&chair))
            .await
            .unwrap();

        assert_eq!(event.status, RideStatus::Enroute);
        assert_eq!(store.current_status(ride.id), Some(RideStatus::Enroute));
    }

    #[tokio::test]
    async fn other_chair_is_rejected_without_mutation() {
        let (store, machine) = setup();
        let chair = seed_chair(&store, 5, None).await;
        let stranger = seed_chair(&store, 5, None).await;
        let ride = seed_ride(&store, Uuid::new_v4(), pickup(), destination(), 0);
        advance_to(&store, &ride, &chair, RideStatus::Matched).await;

        let err = machine
            .request_transition(ride.id, RideStatus::Enroute, &principal(&stranger))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NotAssigned(id) if id == ride.id));
        assert_eq!(store.current_status(ride.id), Some(RideStatus::Matched));
    }

    #[tokio::test]
    async fn carrying_requires_pickup() {
        let (store, machine) = setup();
        let chair = seed_chair(&store, 5, None).await;
        let ride = seed_ride(&store, Uuid::new_v4(), pickup(), destination(), 0);
        advance_to(&store, &ride, &chair, RideStatus::Enroute).await;

        let err = machine
            .request_transition(ride.id, RideStatus::Carrying, &principal(&chair))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: RideStatus::Enroute,
                to: RideStatus::Carrying
            }
        ));

        let guard = store.lock_ride(ride.id).await;
        store.append_status(&guard, RideStatus::Pickup).unwrap();
        drop(guard);

        let event = machine
            .request_transition(ride.id, RideStatus::Carrying, &principal(&chair))
            .await
            .unwrap();
        assert_eq!(event.status, RideStatus::Carrying);
    }

    #[tokio::test]
    async fn chairs_cannot_request_automatic_statuses() {
        let (store, machine) = setup();
        let chair = seed_chair(&store, 5, None).await;
        let ride = seed_ride(&store, Uuid::new_v4(), pickup(), destination(), 0);
        advance_to(&store, &ride, &chair, RideStatus::Enroute).await;

        for requested in [
            RideStatus::Pickup,
            RideStatus::Arrived,
            RideStatus::Completed,
            RideStatus::Canceled,
        ] {
            let result = machine
                .request_transition(ride.id, requested, &principal(&chair))
                .await;
            assert!(matches!(result, Err(AppError::InvalidTransition { .. })));
        }
        assert_eq!(store.ride_status_events(ride.id).len(), 3);
    }

    #[test]
    fn automatic_transitions_need_exact_coordinates() {
        let ride = crate::models::ride::Ride::new(Uuid::new_v4(), pickup(), destination());

        assert_eq!(
            RideStateMachine::automatic_transition(&ride, RideStatus::Enroute, &pickup()),
            Some(RideStatus::Pickup)
        );
        assert_eq!(
            RideStateMachine::automatic_transition(
                &ride,
                RideStatus::Enroute,
                &Coordinate::new(10, 11)
            ),
            None
        );
        assert_eq!(
            RideStateMachine::automatic_transition(&ride, RideStatus::Carrying, &destination()),
            Some(RideStatus::Arrived)
        );
        assert_eq!(
            RideStateMachine::automatic_transition(&ride, RideStatus::Pickup, &pickup()),
            None
        );
        assert_eq!(
            RideStateMachine::automatic_transition(&ride, RideStatus::Arrived, &destination()),
            None
        );
    }

    #[tokio::test]
    async fn completion_only_after_arrival() {
        let (store, machine) = setup();
        let chair = seed_chair(&store, 5, None).await;
        let ride = seed_ride(&store, Uuid::new_v4(), pickup(), destination(), 0);
        advance_to(&store, &ride, &chair, RideStatus::Carrying).await;

        let guard = store.lock_ride(ride.id).await;
        assert!(machine.complete_locked(&guard).is_err());

        store.append_status(&guard, RideStatus::Arrived).unwrap();
        let event = machine.complete_locked(&guard).unwrap();
        assert_eq!(event.status, RideStatus::Completed);
    }

    #[tokio::test]
    async fn rider_cancels_until_terminal() {
        let (store, machine) = setup();
        let user_id = Uuid::new_v4();
        let ride = seed_ride(&store, user_id, pickup(), destination(), 0);
        let rider = RiderPrincipal { user_id };

        let stranger = RiderPrincipal {
            user_id: Uuid::new_v4(),
        };
        assert!(matches!(
            machine.cancel(ride.id, &stranger).await,
            Err(AppError::Unauthorized(_))
        ));

        let event = machine.cancel(ride.id, &rider).await.unwrap();
        assert_eq!(event.status, RideStatus::Canceled);

        assert!(matches!(
            machine.cancel(ride.id, &rider).await,
            Err(AppError::InvalidTransition {
                from: RideStatus::Canceled,
                to: RideStatus::Canceled
            })
        ));
    }

    #[tokio::test]
    async fn started_settlement_blocks_cancel() {
        let (store, machine) = setup();
        let user_id = Uuid::new_v4();
        let chair = seed_chair(&store, 5, None).await;
        let ride = seed_ride(&store, user_id, pickup(), destination(), 0);
        advance_to(&store, &ride, &chair, RideStatus::Arrived).await;

        let guard = store.lock_settlement(user_id).await;
        store
            .save_settlement(&guard, FareSettlement::pending(ride.id, 1200))
            .unwrap();
        drop(guard);

        let err = machine
            .cancel(ride.id, &RiderPrincipal { user_id })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.current_status(ride.id), Some(RideStatus::Arrived));
    }

    #[tokio::test]
    async fn cancel_leaves_no_idle_locks_behind() {
        let (store, machine) = setup();
        let user_id = Uuid::new_v4();
        let ride = seed_ride(&store, user_id, pickup(), destination(), 0);

        machine.cancel(ride.id, &RiderPrincipal { user_id }).await.unwrap();
        assert_eq!(store.lock_entries(), (0, 0));
    }
}
