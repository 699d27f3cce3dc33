use std::sync::Arc;

use tokio::time::Duration;

use crate::cache::Cache;
use crate::config::Config;
use crate::engine::dispatch::DispatchScheduler;
use crate::engine::ledger::DistanceLedger;
use crate::engine::ride_state::RideStateMachine;
use crate::engine::settlement::{FarePolicy, RetryPolicy, SettlementService};
use crate::engine::tracker::LocationTracker;
use crate::models::principal::{ChairPrincipal, OwnerPrincipal, RiderPrincipal};
use crate::observability::metrics::Metrics;
use crate::payment::PaymentGateway;
use crate::store::Store;

const SESSION_COST: u64 = 1;

pub struct AppState {
    pub store: Arc<Store>,
    pub ledger: Arc<DistanceLedger>,
    pub rides: Arc<RideStateMachine>,
    pub tracker: LocationTracker,
    pub dispatcher: Arc<DispatchScheduler>,
    pub settlement: SettlementService,
    pub chair_sessions: Cache<String, ChairPrincipal>,
    pub rider_sessions: Cache<String, RiderPrincipal>,
    pub owner_sessions: Cache<String, OwnerPrincipal>,
    pub notification_interval: Duration,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config, gateway: Arc<dyn PaymentGateway>) -> Self {
        let metrics = Metrics::new();
        let store = Arc::new(Store::new());

        let ledger = Arc::new(DistanceLedger::new(store.clone(), config.cache_max_cost));
        let rides = Arc::new(RideStateMachine::new(store.clone(), metrics.clone()));
        let tracker = LocationTracker::new(store.clone(), ledger.clone(), rides.clone(), metrics.clone());
        let dispatcher = Arc::new(DispatchScheduler::new(store.clone(), metrics.clone()));
        let settlement = SettlementService::new(
            store.clone(),
            rides.clone(),
            gateway,
            FarePolicy {
                initial_fare: config.initial_fare,
                fare_per_distance: config.fare_per_distance,
            },
            RetryPolicy {
                max_retries: config.payment_max_retries,
                base_delay: Duration::from_millis(config.payment_base_delay_ms),
            },
            metrics.clone(),
        );

        Self {
            store,
            ledger,
            rides,
            tracker,
            dispatcher,
            settlement,
            chair_sessions: Cache::new(config.cache_max_cost),
            rider_sessions: Cache::new(config.cache_max_cost),
            owner_sessions: Cache::new(config.cache_max_cost),
            notification_interval: config.notification_interval(),
            metrics,
        }
    }

    /// Caches a session token once it has been resolved against the store.
    pub fn remember_chair_session(&self, token: &str, principal: ChairPrincipal) {
        self.chair_sessions.set(token.to_string(), principal, SESSION_COST);
    }

    pub fn remember_rider_session(&self, token: &str, principal: RiderPrincipal) {
        self.rider_sessions.set(token.to_string(), principal, SESSION_COST);
    }

    pub fn remember_owner_session(&self, token: &str, principal: OwnerPrincipal) {
        self.owner_sessions.set(token.to_string(), principal, SESSION_COST);
    }
}
