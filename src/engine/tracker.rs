use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::engine::ledger::DistanceLedger;
use crate::engine::ride_state::RideStateMachine;
use crate::error::AppError;
use crate::geo::manhattan_distance;
use crate::models::chair::Coordinate;
use crate::models::principal::ChairPrincipal;
use crate::models::ride::RideStatus;
use crate::observability::metrics::Metrics;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct PositionReport {
    pub recorded_at: DateTime<Utc>,
    /// Distance from the chair's previous sample; zero for the first one.
    pub step_distance: i64,
    pub total_distance: i64,
    pub status_change: Option<RideStatus>,
}

pub struct LocationTracker {
    store: Arc<Store>,
    ledger: Arc<DistanceLedger>,
    rides: Arc<RideStateMachine>,
    metrics: Metrics,
}

impl LocationTracker {
    pub fn new(
        store: Arc<Store>,
        ledger: Arc<DistanceLedger>,
        rides: Arc<RideStateMachine>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            ledger,
            rides,
            metrics,
        }
    }

    /// Records a position sample, folds it into the chair's distance and
    /// applies any status change it implies for the chair's current ride.
    pub async fn report_position(
        &self,
        chair: &ChairPrincipal,
        coordinate: Coordinate,
    ) -> Result<PositionReport, AppError> {
        let chair_guard = self.store.lock_chair(chair.chair_id).await;

        // No ride can be assigned to this chair while its guard is held, so
        // the ride found here stays the chair's latest until we are done. A
        // terminal ride never moves again and is left unlocked.
        let ride_guard = match self.store.latest_ride_for_chair(chair.chair_id) {
            Some(ride)
                if !self
                    .store
                    .current_status(ride.id)
                    .is_some_and(RideStatus::is_terminal) =>
            {
                Some(self.store.lock_ride(ride.id).await)
            }
            _ => None,
        };

        // no suspension points past this line

        let previous = self.store.latest_chair_location(chair.chair_id);
        let sample = self
            .store
            .insert_chair_location(&chair_guard, coordinate, Utc::now());
        let step_distance = previous
            .map(|previous| manhattan_distance(&previous.coordinate, &coordinate))
            .unwrap_or(0);

        let aggregate = self.ledger.record_sample_locked(&chair_guard, &sample)?;
        self.store
            .update_chair_distance(chair.chair_id, aggregate.total_distance, aggregate.updated_at);

        let status_change = match &ride_guard {
            Some(guard) => {
                let current = self.rides.current_status(guard.ride_id())?;
                if current.is_terminal() {
                    None
                } else {
                    self.rides
                        .apply_position_locked(guard, &coordinate)?
                        .map(|event| event.status)
                }
            }
            None => None,
        };

        self.metrics.position_reports_total.inc();
        debug!(
            chair_id = %chair.chair_id,
            step_distance,
            total_distance = aggregate.total_distance,
            "position recorded"
        );

        Ok(PositionReport {
            recorded_at: sample.created_at,
            step_distance,
            total_distance: aggregate.total_distance,
            status_change,
        })
    }
}
