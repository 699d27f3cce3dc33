use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::AppError;
use crate::geo::manhattan_distance;
use crate::models::chair::{ChairLocation, Coordinate};
use crate::store::{ChairGuard, Store};

const AGGREGATE_COST: u64 = 1;

/// Cumulative travel distance of one chair, folded over its position history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DistanceAggregate {
    pub chair_id: Uuid,
    pub total_distance: i64,
    /// Creation time of the last sample folded in; `None` without samples.
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    sample_count: usize,
    #[serde(skip)]
    last_sample: Option<(Uuid, Coordinate)>,
}

impl DistanceAggregate {
    fn empty(chair_id: Uuid) -> Self {
        Self {
            chair_id,
            total_distance: 0,
            updated_at: None,
            sample_count: 0,
            last_sample: None,
        }
    }

    fn fold(mut self, samples: &[ChairLocation]) -> Self {
        for sample in samples {
            if let Some((_, previous)) = self.last_sample {
                self.total_distance += manhattan_distance(&previous, &sample.coordinate);
            }
            self.last_sample = Some((sample.id, sample.coordinate));
            self.updated_at = Some(sample.created_at);
            self.sample_count += 1;
        }
        self
    }
}

/// Per-chair travel distance, cached and maintained incrementally.
///
/// The store is authoritative: a cache miss always rebuilds from the full
/// history. Every read-modify-write of a cached aggregate happens under the
/// chair's lock, so concurrent reports cannot lose an update.
pub struct DistanceLedger {
    store: Arc<Store>,
    cache: Cache<Uuid, DistanceAggregate>,
}

impl DistanceLedger {
    pub fn new(store: Arc<Store>, cache_max_cost: u64) -> Self {
        Self {
            store,
            cache: Cache::new(cache_max_cost),
        }
    }

    pub async fn total_distance(&self, chair_id: Uuid) -> DistanceAggregate {
        if let Some(aggregate) = self.cache.get(&chair_id) {
            return aggregate;
        }

        let guard = self.store.lock_chair(chair_id).await;
        self.total_distance_locked(&guard)
    }

    pub fn total_distance_locked(&self, guard: &ChairGuard) -> DistanceAggregate {
        let chair_id = guard.chair_id();
        match self.cache.get(&chair_id) {
            Some(aggregate) => aggregate,
            None => self.rebuild(chair_id),
        }
    }

    /// Folds a persisted sample into the chair's aggregate.
    pub async fn record_sample(&self, sample: &ChairLocation) -> Result<DistanceAggregate, AppError> {
        let guard = self.store.lock_chair(sample.chair_id).await;
        self.record_sample_locked(&guard, sample)
    }

    pub fn record_sample_locked(
        &self,
        guard: &ChairGuard,
        sample: &ChairLocation,
    ) -> Result<DistanceAggregate, AppError> {
        let chair_id = guard.chair_id();
        if sample.chair_id != chair_id {
            return Err(AppError::Internal(format!(
                "sample {} belongs to chair {}, not {chair_id}",
                sample.id, sample.chair_id
            )));
        }

        // a cold rebuild already includes the persisted sample
        let Some(cached) = self.cache.get(&chair_id) else {
            return Ok(self.rebuild(chair_id));
        };

        let anchor = cached.last_sample.map(|(id, _)| id);
        let Some(tail) = self
            .store
            .chair_locations_after(chair_id, anchor, cached.sample_count)
        else {
            warn!(
                chair_id = %chair_id,
                sample_id = %sample.id,
                "sample arrived out of order; rebuilding distance"
            );
            self.cache.invalidate(&chair_id);
            return Ok(self.rebuild(chair_id));
        };

        let aggregate = cached.fold(&tail);
        self.cache.set(chair_id, aggregate.clone(), AGGREGATE_COST);
        Ok(aggregate)
    }

    pub fn invalidate(&self, chair_id: Uuid) {
        self.cache.invalidate(&chair_id);
    }

    fn rebuild(&self, chair_id: Uuid) -> DistanceAggregate {
        let history = self.store.chair_locations(chair_id);
        let aggregate = DistanceAggregate::empty(chair_id).fold(&history);

        debug!(
            chair_id = %chair_id,
            samples = aggregate.sample_count,
            total_distance = aggregate.total_distance,
            "distance rebuilt from history"
        );

        self.cache.set(chair_id, aggregate.clone(), AGGREGATE_COST);
        aggregate
    }
}
