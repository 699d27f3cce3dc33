use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::scoring::{DispatchCandidate, rank_candidates, score_candidate};
use crate::error::AppError;
use crate::models::assignment::Assignment;
use crate::models::ride::{Ride, RideStatus};
use crate::observability::metrics::Metrics;
use crate::store::{RideGuard, Store};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Assigned(Assignment),
    NoRidePending,
    NoChairAvailable,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Assigned(_) => "assigned",
            DispatchOutcome::NoRidePending => "no_ride_pending",
            DispatchOutcome::NoChairAvailable => "no_chair_available",
        }
    }
}

/// Pairs the oldest waiting ride with the chair that can reach it soonest.
pub struct DispatchScheduler {
    store: Arc<Store>,
    metrics: Metrics,
}

impl DispatchScheduler {
    pub fn new(store: Arc<Store>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    pub async fn run_once(&self) -> Result<DispatchOutcome, AppError> {
        let start = Instant::now();
        let result = self.dispatch().await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&[label])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .dispatch_runs_total
            .with_label_values(&[label])
            .inc();
        self.metrics
            .pending_rides
            .set(self.store.pending_rides().len() as i64);

        result
    }

    async fn dispatch(&self) -> Result<DispatchOutcome, AppError> {
        for pending in self.store.pending_rides() {
            let ride_guard = self.store.lock_ride(pending.id).await;

            // another run may have matched or the rider canceled while we waited
            let Some(ride) = self.store.ride(pending.id) else {
                continue;
            };
            if ride.chair_id.is_some()
                || self.store.current_status(ride.id) != Some(RideStatus::New)
            {
                debug!(ride_id = %ride.id, "ride no longer pending; trying next");
                continue;
            }

            return self.assign_best_chair(&ride_guard, &ride).await;
        }

        Ok(DispatchOutcome::NoRidePending)
    }

    async fn assign_best_chair(
        &self,
        ride_guard: &RideGuard,
        ride: &Ride,
    ) -> Result<DispatchOutcome, AppError> {
        let ranked = rank_candidates(self.candidates(ride));
        if ranked.is_empty() {
            debug!(ride_id = %ride.id, "no eligible chairs");
            return Ok(DispatchOutcome::NoChairAvailable);
        }

        for candidate in ranked {
            let chair_guard = self.store.lock_chair(candidate.chair_id).await;

            // the chair may have been booked or gone inactive while ranking
            if !self.is_available(candidate.chair_id) {
                continue;
            }

            self.store.assign_chair(ride_guard, &chair_guard)?;
            self.metrics
                .ride_status_transitions_total
                .with_label_values(&[RideStatus::Matched.as_str()])
                .inc();

            let assignment = Assignment {
                ride_id: ride.id,
                chair_id: candidate.chair_id,
                pickup_distance: candidate.pickup_distance,
                estimated_travel_time: candidate.estimated_travel_time,
                assigned_at: Utc::now(),
            };

            info!(
                ride_id = %ride.id,
                chair_id = %candidate.chair_id,
                estimated_travel_time = candidate.estimated_travel_time,
                "ride matched"
            );

            return Ok(DispatchOutcome::Assigned(assignment));
        }

        Ok(DispatchOutcome::NoChairAvailable)
    }

    fn is_available(&self, chair_id: uuid::Uuid) -> bool {
        self.store
            .chair(chair_id)
            .is_some_and(|chair| chair.is_active)
            && !self.store.chair_has_active_ride(chair_id)
    }

    fn candidates(&self, ride: &Ride) -> Vec<DispatchCandidate> {
        self.store
            .chairs()
            .into_iter()
            .filter(|chair| chair.is_active && !self.store.chair_has_active_ride(chair.id))
            .filter_map(|chair| {
                let location = self.store.latest_chair_location(chair.id)?;
                score_candidate(&chair, &location.coordinate, &ride.pickup)
            })
            .collect()
    }
}

/// Runs the scheduler on a fixed period until `cancel` fires.
pub async fn run_dispatch_loop(
    scheduler: Arc<DispatchScheduler>,
    period: Duration,
    cancel: CancellationToken,
) {
    info!(period_ms = period.as_millis() as u64, "dispatch loop started");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = scheduler.run_once().await {
                    error!(error = %err, "dispatch run failed");
                }
            }
        }
    }

    info!("dispatch loop stopped");
}
