use std::sync::Arc;

use chrono::Utc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::ride_state::RideStateMachine;
use crate::error::AppError;
use crate::geo::manhattan_distance;
use crate::models::principal::RiderPrincipal;
use crate::models::ride::{Ride, RideStatus};
use crate::models::settlement::{FareSettlement, SettlementOutcome};
use crate::observability::metrics::Metrics;
use crate::payment::{GatewayError, PaymentGateway, PaymentRequest};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct FarePolicy {
    pub initial_fare: i64,
    pub fare_per_distance: i64,
}

impl FarePolicy {
    /// Priced on the straight pickup to destination distance, not on the
    /// path the chair actually drove.
    pub fn fare(&self, ride: &Ride) -> i64 {
        self.initial_fare + self.fare_per_distance * manhattan_distance(&ride.pickup, &ride.destination)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): base, 2x base, 4x base...
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Confirmation {
    Paid,
    Reconciled,
}

impl Confirmation {
    fn outcome(self) -> SettlementOutcome {
        match self {
            Confirmation::Paid => SettlementOutcome::Paid,
            Confirmation::Reconciled => SettlementOutcome::Reconciled,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Confirmation::Paid => "paid",
            Confirmation::Reconciled => "reconciled",
        }
    }
}

enum AttemptError {
    Transient(GatewayError),
    Diverged { expected: usize, actual: usize },
}

enum SubmitFailure {
    Exhausted(GatewayError),
    Diverged { expected: usize, actual: usize },
}

/// Charges riders for arrived rides and completes them once the gateway
/// confirms the payment.
pub struct SettlementService {
    store: Arc<Store>,
    rides: Arc<RideStateMachine>,
    gateway: Arc<dyn PaymentGateway>,
    fares: FarePolicy,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl SettlementService {
    pub fn new(
        store: Arc<Store>,
        rides: Arc<RideStateMachine>,
        gateway: Arc<dyn PaymentGateway>,
        fares: FarePolicy,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            rides,
            gateway,
            fares,
            retry,
            metrics,
        }
    }

    pub fn settlement(&self, ride_id: Uuid) -> Option<FareSettlement> {
        self.store.settlement(ride_id)
    }

    pub fn fares(&self) -> FarePolicy {
        self.fares
    }

    /// Settles an `ARRIVED` ride and appends `COMPLETED` on success. Settling
    /// a ride that is already paid returns the recorded settlement without
    /// contacting the gateway again; a diverged settlement is refused.
    ///
    /// A rider's settlements run one at a time, so the reconciliation count
    /// never races another payment of the same rider.
    pub async fn settle(
        &self,
        ride_id: Uuid,
        requester: &RiderPrincipal,
    ) -> Result<FareSettlement, AppError> {
        let ride = self
            .store
            .ride(ride_id)
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))?;
        if ride.user_id != requester.user_id {
            return Err(AppError::Unauthorized(format!(
                "ride {ride_id} belongs to another user"
            )));
        }

        let result = self.settle_serialized(&ride).await;

        self.store.release_settlement_lock(ride.user_id);
        if self
            .store
            .current_status(ride_id)
            .is_some_and(RideStatus::is_terminal)
        {
            self.store.release_ride_lock(ride_id);
        }
        result
    }

    async fn settle_serialized(&self, ride: &Ride) -> Result<FareSettlement, AppError> {
        let ride_id = ride.id;
        let settlement_guard = self.store.lock_settlement(ride.user_id).await;

        let existing = self.store.settlement(ride_id);
        if let Some(settled) = existing.as_ref().filter(|s| s.is_settled()) {
            let ride_guard = self.store.lock_ride(ride_id).await;
            if self.rides.current_status(ride_id)? == RideStatus::Arrived {
                self.rides.complete_locked(&ride_guard)?;
                warn!(ride_id = %ride_id, "paid ride was still arrived; completed it");
            }
            return Ok(settled.clone());
        }
        if let Some(SettlementOutcome::Diverged { expected, actual }) =
            existing.as_ref().map(|s| &s.outcome)
        {
            return Err(AppError::PaymentDiverged {
                expected: *expected,
                actual: *actual,
            });
        }

        {
            let _ride_guard = self.store.lock_ride(ride_id).await;
            let current = self.rides.current_status(ride_id)?;
            if current != RideStatus::Arrived {
                return Err(AppError::InvalidTransition {
                    from: current,
                    to: RideStatus::Completed,
                });
            }
        }

        let token = self
            .store
            .user(ride.user_id)
            .and_then(|user| user.payment_token)
            .ok_or_else(|| {
                AppError::BadRequest(format!("user {} has no payment token", ride.user_id))
            })?;

        let fare = self.fares.fare(ride);
        // an earlier run may have been charged before it could record the outcome
        let resumed = existing.is_some();
        let mut settlement = existing.unwrap_or_else(|| FareSettlement::pending(ride_id, fare));
        settlement.fare = fare;
        settlement.outcome = SettlementOutcome::Pending;
        self.store
            .save_settlement(&settlement_guard, settlement.clone())?;

        let (result, attempts) = if resumed {
            self.resume(&token, fare, ride.user_id).await
        } else {
            self.submit_with_retry(&token, fare, ride.user_id).await
        };
        settlement.attempts += attempts;

        match result {
            Ok(confirmation) => {
                let ride_guard = self.store.lock_ride(ride_id).await;
                settlement.settled_at = Some(Utc::now());

                if let Err(err) = self.rides.complete_locked(&ride_guard) {
                    settlement.outcome = SettlementOutcome::Unresolved {
                        last_error: format!("payment confirmed but ride not completed: {err}"),
                    };
                    self.store.save_settlement(&settlement_guard, settlement)?;
                    self.record_settlement("unresolved");

                    error!(ride_id = %ride_id, error = %err, "payment confirmed for a ride that left ARRIVED");
                    return Err(AppError::Conflict(format!(
                        "ride {ride_id} changed while its payment was in flight"
                    )));
                }

                settlement.outcome = confirmation.outcome();
                self.store
                    .save_settlement(&settlement_guard, settlement.clone())?;
                self.record_settlement(confirmation.label());

                info!(
                    ride_id = %ride_id,
                    fare,
                    attempts = settlement.attempts,
                    outcome = confirmation.label(),
                    "ride settled"
                );
                Ok(settlement)
            }
            Err(SubmitFailure::Diverged { expected, actual }) => {
                settlement.outcome = SettlementOutcome::Diverged { expected, actual };
                self.store.save_settlement(&settlement_guard, settlement)?;
                self.record_settlement("diverged");

                error!(
                    ride_id = %ride_id,
                    expected,
                    actual,
                    "payment history diverged from completed rides"
                );
                Err(AppError::PaymentDiverged { expected, actual })
            }
            Err(SubmitFailure::Exhausted(last)) => {
                settlement.outcome = SettlementOutcome::Unresolved {
                    last_error: last.to_string(),
                };
                self.store.save_settlement(&settlement_guard, settlement)?;
                self.record_settlement("unresolved");

                error!(ride_id = %ride_id, error = %last, "payment retries exhausted");
                Err(AppError::PaymentUnavailable(last.to_string()))
            }
        }
    }

    /// Picks up a settlement an earlier run left unfinished. The gateway
    /// history says whether that run's payment went through; only a history
    /// one short of the expected count is charged again.
    async fn resume(
        &self,
        token: &str,
        fare: i64,
        user_id: Uuid,
    ) -> (Result<Confirmation, SubmitFailure>, u32) {
        let history = match self.gateway.payments(token).await {
            Ok(history) => history,
            Err(err) => {
                self.record_attempt("transient");
                return (Err(SubmitFailure::Exhausted(err)), 0);
            }
        };

        let expected = self.expected_payments(user_id);
        match history.len() {
            actual if actual == expected => {
                self.record_attempt("reconciled");
                info!(user_id = %user_id, "earlier payment found in gateway history");
                (Ok(Confirmation::Reconciled), 0)
            }
            actual if actual + 1 == expected => self.submit_with_retry(token, fare, user_id).await,
            actual => {
                self.record_attempt("diverged");
                (Err(SubmitFailure::Diverged { expected, actual }), 0)
            }
        }
    }

    /// Payments the gateway should hold for the rider once the ride being
    /// settled is paid: every completed ride plus this one.
    fn expected_payments(&self, user_id: Uuid) -> usize {
        self.store.completed_rides_for_user(user_id).len() + 1
    }

    async fn submit_with_retry(
        &self,
        token: &str,
        fare: i64,
        user_id: Uuid,
    ) -> (Result<Confirmation, SubmitFailure>, u32) {
        let mut attempts = 0;
        let mut retry = 0;

        loop {
            attempts += 1;
            match self.attempt(token, fare, user_id).await {
                Ok(confirmation) => {
                    self.record_attempt(confirmation.label());
                    return (Ok(confirmation), attempts);
                }
                Err(AttemptError::Diverged { expected, actual }) => {
                    self.record_attempt("diverged");
                    return (Err(SubmitFailure::Diverged { expected, actual }), attempts);
                }
                Err(AttemptError::Transient(err)) => {
                    self.record_attempt("transient");
                    if retry >= self.retry.max_retries {
                        return (Err(SubmitFailure::Exhausted(err)), attempts);
                    }

                    retry += 1;
                    let delay = self.retry.delay(retry);
                    warn!(
                        error = %err,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "payment attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One POST, followed by a reconciliation read when the gateway answers
    /// with anything but success.
    async fn attempt(&self, token: &str, fare: i64, user_id: Uuid) -> Result<Confirmation, AttemptError> {
        let rejection = match self
            .gateway
            .post_payment(token, PaymentRequest { amount: fare })
            .await
        {
            Ok(()) => return Ok(Confirmation::Paid),
            Err(err @ GatewayError::Rejected { .. }) => err,
            Err(err) => return Err(AttemptError::Transient(err)),
        };

        let history = self
            .gateway
            .payments(token)
            .await
            .map_err(AttemptError::Transient)?;

        let expected = self.expected_payments(user_id);
        if history.len() != expected {
            return Err(AttemptError::Diverged {
                expected,
                actual: history.len(),
            });
        }

        info!(error = %rejection, "payment confirmed by reconciliation");
        Ok(Confirmation::Reconciled)
    }

    fn record_attempt(&self, result: &str) {
        self.metrics
            .payment_attempts_total
            .with_label_values(&[result])
            .inc();
    }

    fn record_settlement(&self, outcome: &str) {
        self.metrics
            .settlements_total
            .with_label_values(&[outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use tokio::sync::Notify;
    use tokio::time::{Duration, Instant, timeout};
    use uuid::Uuid;

    use super::{FarePolicy, RetryPolicy, SettlementService};
    use crate::engine::ride_state::RideStateMachine;
    use crate::error::AppError;
    use crate::models::chair::Coordinate;
    use crate::models::principal::RiderPrincipal;
    use crate::models::ride::{Ride, RideStatus};
    use crate::models::settlement::{FareSettlement, SettlementOutcome};
    use crate::models::user::User;
    use crate::observability::metrics::Metrics;
    use crate::payment::{GatewayError, PaymentGateway, PaymentRecord, PaymentRequest};
    use crate::store::{RideGuard, Store};
    use crate::test_support::{advance_to, seed_chair, seed_ride, seed_user};

    type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

    /// Plays back scripted POST answers; once the script runs out every POST
    /// fails with a transport error. A hook, if set, runs inside the next
    /// POST before it answers.
    #[derive(Default)]
    struct ScriptedGateway {
        posts: Mutex<VecDeque<Result<(), GatewayError>>>,
        history_len: Mutex<Option<usize>>,
        hook: Mutex<Option<Hook>>,
        post_calls: AtomicUsize,
        get_calls: AtomicUsize,
        amounts: Mutex<Vec<i64>>,
    }

    impl ScriptedGateway {
        fn new(posts: Vec<Result<(), GatewayError>>, history_len: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                posts: Mutex::new(posts.into()),
                history_len: Mutex::new(history_len),
                ..Default::default()
            })
        }

        fn post_calls(&self) -> usize {
            self.post_calls.load(Ordering::SeqCst)
        }

        fn get_calls(&self) -> usize {
            self.get_calls.load(Ordering::SeqCst)
        }

        fn on_next_post(&self, hook: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) {
            *self.hook.lock().unwrap() = Some(Box::new(hook));
        }

        async fn wait_for_posts(&self, count: usize) {
            while self.post_calls() < count {
                tokio::task::yield_now().await;
            }
        }
    }

    impl PaymentGateway for ScriptedGateway {
        fn post_payment<'a>(
            &'a self,
            _token: &'a str,
            request: PaymentRequest,
        ) -> BoxFuture<'a, Result<(), GatewayError>> {
            self.post_calls.fetch_add(1, Ordering::SeqCst);
            self.amounts.lock().unwrap().push(request.amount);
            let answer = self
                .posts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Transport("connection refused".into())));
            let hook = self.hook.lock().unwrap().take();
            async move {
                if let Some(hook) = hook {
                    hook().await;
                }
                answer
            }
            .boxed()
        }

        fn payments<'a>(
            &'a self,
            _token: &'a str,
        ) -> BoxFuture<'a, Result<Vec<PaymentRecord>, GatewayError>> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let answer = match *self.history_len.lock().unwrap() {
                Some(len) => Ok(vec![
                    PaymentRecord {
                        amount: 1200,
                        status: "ok".into(),
                    };
                    len
                ]),
                None => Err(GatewayError::Transport("timed out".into())),
            };
            futures::future::ready(answer).boxed()
        }
    }

    fn server_error() -> Result<(), GatewayError> {
        Err(GatewayError::Rejected {
            status: 500,
            message: "internal".into(),
        })
    }

    struct Fixture {
        store: Arc<Store>,
        rides: Arc<RideStateMachine>,
        service: Arc<SettlementService>,
        rider: RiderPrincipal,
        ride: Ride,
    }

    impl Fixture {
        fn chair_of(&self, ride_id: Uuid) -> Uuid {
            self.store.ride(ride_id).unwrap().chair_id.unwrap()
        }

        /// Another arrived ride for the same rider, on its own chair.
        async fn second_arrived_ride(&self) -> Ride {
            let chair = seed_chair(&self.store, 5, None).await;
            let ride = seed_ride(&self.store, self.rider.user_id, Coordinate::new(1, 1), Coordinate::new(2, 2), 0);
            advance_to(&self.store, &ride, &chair, RideStatus::Arrived).await;
            ride
        }

        fn spawn_settle(&self, ride_id: Uuid) -> tokio::task::JoinHandle<Result<FareSettlement, AppError>> {
            let service = self.service.clone();
            let rider = self.rider;
            tokio::spawn(async move { service.settle(ride_id, &rider).await })
        }
    }

    async fn fixture(gateway: Arc<ScriptedGateway>, status: RideStatus) -> Fixture {
        let store = Arc::new(Store::new());
        let metrics = Metrics::new();
        let rides = Arc::new(RideStateMachine::new(store.clone(), metrics.clone()));
        let service = SettlementService::new(
            store.clone(),
            rides.clone(),
            gateway,
            FarePolicy {
                initial_fare: 500,
                fare_per_distance: 100,
            },
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
            },
            metrics,
        );

        let user = seed_user(&store, "pay-token");
        let chair = seed_chair(&store, 5, None).await;
        let ride = seed_ride(&store, user.id, Coordinate::new(0, 0), Coordinate::new(3, 4), 0);
        advance_to(&store, &ride, &chair, status).await;

        Fixture {
            store,
            rides,
            service: Arc::new(service),
            rider: RiderPrincipal { user_id: user.id },
            ride,
        }
    }

    #[test]
    fn fare_uses_pickup_to_destination_distance() {
        let policy = FarePolicy {
            initial_fare: 500,
            fare_per_distance: 100,
        };
        let ride = Ride::new(Uuid::new_v4(), Coordinate::new(0, 0), Coordinate::new(3, 4));
        assert_eq!(policy.fare(&ride), 1200);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        };
        let delays: Vec<u64> = (1..=5).map(|retry| policy.delay(retry).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[tokio::test]
    async fn accepted_payment_completes_the_ride() {
        let gateway = ScriptedGateway::new(vec![Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;

        let settlement = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(settlement.fare, 1200);
        assert_eq!(settlement.outcome, SettlementOutcome::Paid);
        assert_eq!(settlement.attempts, 1);
        assert!(settlement.settled_at.is_some());
        assert_eq!(*gateway.amounts.lock().unwrap(), vec![1200]);
        assert_eq!(gateway.get_calls(), 0);
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));

        assert!(!f.store.chair_has_active_ride(f.chair_of(f.ride.id)));
    }

    #[tokio::test]
    async fn rejected_post_is_reconciled_against_history() {
        let gateway = ScriptedGateway::new(vec![server_error()], Some(1));
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;

        let settlement = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(settlement.outcome, SettlementOutcome::Reconciled);
        assert_eq!(gateway.post_calls(), 1);
        assert_eq!(gateway.get_calls(), 1);
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));
    }

    #[tokio::test]
    async fn reconciliation_counts_earlier_completed_rides() {
        let gateway = ScriptedGateway::new(vec![Ok(()), server_error()], Some(2));
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        f.service.settle(f.ride.id, &f.rider).await.unwrap();

        let second = f.second_arrived_ride().await;

        let settlement = f.service.settle(second.id, &f.rider).await.unwrap();
        assert_eq!(settlement.outcome, SettlementOutcome::Reconciled);
        assert_eq!(gateway.post_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn history_mismatch_is_fatal_without_retry() {
        let gateway = ScriptedGateway::new(vec![server_error()], Some(0));
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let started = Instant::now();

        let err = f.service.settle(f.ride.id, &f.rider).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::PaymentDiverged {
                expected: 1,
                actual: 0
            }
        ));
        assert_eq!(gateway.post_calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Arrived));
        assert_eq!(
            f.service.settlement(f.ride.id).unwrap().outcome,
            SettlementOutcome::Diverged {
                expected: 1,
                actual: 0
            }
        );

        // settling again is refused without touching the gateway
        gateway.posts.lock().unwrap().push_back(Ok(()));
        let again = f.service.settle(f.ride.id, &f.rider).await.unwrap_err();
        assert!(matches!(again, AppError::PaymentDiverged { .. }));
        assert_eq!(gateway.post_calls(), 1);
        assert_eq!(gateway.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_surface() {
        let gateway = ScriptedGateway::new(Vec::new(), None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let started = Instant::now();

        let err = f.service.settle(f.ride.id, &f.rider).await.unwrap_err();

        assert!(matches!(err, AppError::PaymentUnavailable(_)));
        assert_eq!(gateway.post_calls(), 6);
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Arrived));

        let settlement = f.service.settlement(f.ride.id).unwrap();
        assert_eq!(settlement.attempts, 6);
        assert!(matches!(settlement.outcome, SettlementOutcome::Unresolved { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_reconciliation_read_is_retried() {
        let gateway = ScriptedGateway::new(vec![server_error(), server_error(), Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let started = Instant::now();

        let settlement = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(settlement.outcome, SettlementOutcome::Paid);
        assert_eq!(settlement.attempts, 3);
        assert_eq!(gateway.get_calls(), 2);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_settlement_can_be_retried_later() {
        let gateway = ScriptedGateway::new(Vec::new(), None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        assert!(f.service.settle(f.ride.id, &f.rider).await.is_err());

        // the gateway recovers and shows none of the failed attempts landed
        *gateway.history_len.lock().unwrap() = Some(0);
        gateway.posts.lock().unwrap().push_back(Ok(()));
        let settlement = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(settlement.outcome, SettlementOutcome::Paid);
        assert_eq!(settlement.attempts, 7);
        assert_eq!(gateway.post_calls(), 7);
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_settlement_is_not_charged_again_when_history_has_it() {
        let gateway = ScriptedGateway::new(Vec::new(), None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        assert!(f.service.settle(f.ride.id, &f.rider).await.is_err());

        // one of the failed attempts did land after all
        *gateway.history_len.lock().unwrap() = Some(1);
        let settlement = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(settlement.outcome, SettlementOutcome::Reconciled);
        assert_eq!(gateway.post_calls(), 6);
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_with_unreadable_history_exhaust_retries() {
        let gateway = ScriptedGateway::new(vec![server_error(); 6], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let started = Instant::now();

        let err = f.service.settle(f.ride.id, &f.rider).await.unwrap_err();

        assert!(matches!(err, AppError::PaymentUnavailable(_)));
        assert_eq!(gateway.post_calls(), 6);
        assert_eq!(gateway.get_calls(), 6);
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Arrived));
        assert!(matches!(
            f.service.settlement(f.ride.id).unwrap().outcome,
            SettlementOutcome::Unresolved { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_waits_for_settlement_in_flight() {
        let gateway = ScriptedGateway::new(vec![Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let release = Arc::new(Notify::new());
        gateway.on_next_post({
            let release = release.clone();
            move || async move { release.notified().await }.boxed()
        });

        let settling = f.spawn_settle(f.ride.id);
        gateway.wait_for_posts(1).await;

        let blocked = timeout(Duration::from_secs(5), f.rides.cancel(f.ride.id, &f.rider)).await;
        assert!(blocked.is_err());

        release.notify_one();
        let settlement = settling.await.unwrap().unwrap();
        assert_eq!(settlement.outcome, SettlementOutcome::Paid);
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));

        assert!(matches!(
            f.rides.cancel(f.ride.id, &f.rider).await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));
    }

    #[tokio::test]
    async fn ride_canceled_during_payment_is_never_recorded_paid() {
        let gateway = ScriptedGateway::new(vec![Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        gateway.on_next_post({
            let store = f.store.clone();
            let ride_id = f.ride.id;
            move || {
                async move {
                    let guard = store.lock_ride(ride_id).await;
                    store.append_status(&guard, RideStatus::Canceled).unwrap();
                }
                .boxed()
            }
        });

        let err = f.service.settle(f.ride.id, &f.rider).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let recorded = f.service.settlement(f.ride.id).unwrap();
        assert!(!recorded.is_settled());
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Canceled));

        let again = f.service.settle(f.ride.id, &f.rider).await.unwrap_err();
        assert!(matches!(
            again,
            AppError::InvalidTransition {
                from: RideStatus::Canceled,
                to: RideStatus::Completed
            }
        ));
        assert_eq!(gateway.post_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_settlement_completes_without_a_second_charge() {
        let gateway = ScriptedGateway::new(vec![Ok(()), Ok(())], Some(1));
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;

        // the payment goes through, then the caller gives up while the ride
        // is locked elsewhere
        let held: Arc<Mutex<Option<RideGuard>>> = Arc::default();
        gateway.on_next_post({
            let store = f.store.clone();
            let held = held.clone();
            let ride_id = f.ride.id;
            move || {
                async move {
                    let guard = store.lock_ride(ride_id).await;
                    *held.lock().unwrap() = Some(guard);
                }
                .boxed()
            }
        });

        let abandoned = timeout(Duration::from_secs(5), f.service.settle(f.ride.id, &f.rider)).await;
        assert!(abandoned.is_err());
        assert_eq!(
            f.service.settlement(f.ride.id).unwrap().outcome,
            SettlementOutcome::Pending
        );
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Arrived));
        drop(held.lock().unwrap().take());

        let settlement = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(settlement.outcome, SettlementOutcome::Reconciled);
        assert_eq!(gateway.post_calls(), 1);
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));
        assert!(!f.store.chair_has_active_ride(f.chair_of(f.ride.id)));
    }

    #[tokio::test]
    async fn paid_ride_left_arrived_is_completed_on_next_settle() {
        let gateway = ScriptedGateway::new(Vec::new(), None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;

        let guard = f.store.lock_settlement(f.rider.user_id).await;
        let mut paid = FareSettlement::pending(f.ride.id, 1200);
        paid.outcome = SettlementOutcome::Paid;
        f.store.save_settlement(&guard, paid).unwrap();
        drop(guard);

        let settlement = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(settlement.outcome, SettlementOutcome::Paid);
        assert_eq!(gateway.post_calls(), 0);
        assert_eq!(f.store.current_status(f.ride.id), Some(RideStatus::Completed));
        assert!(!f.store.chair_has_active_ride(f.chair_of(f.ride.id)));
    }

    #[tokio::test]
    async fn same_rider_settlements_run_one_at_a_time() {
        let gateway = ScriptedGateway::new(vec![Ok(()), server_error()], Some(2));
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let second = f.second_arrived_ride().await;
        let release = Arc::new(Notify::new());
        gateway.on_next_post({
            let release = release.clone();
            move || async move { release.notified().await }.boxed()
        });

        let first = f.spawn_settle(f.ride.id);
        gateway.wait_for_posts(1).await;
        let other = f.spawn_settle(second.id);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.post_calls(), 1);

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap().outcome, SettlementOutcome::Paid);
        assert_eq!(other.await.unwrap().unwrap().outcome, SettlementOutcome::Reconciled);
        assert_eq!(f.store.current_status(second.id), Some(RideStatus::Completed));
    }

    #[tokio::test]
    async fn settling_releases_idle_locks() {
        let gateway = ScriptedGateway::new(vec![Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let chair_ride_locks = f.store.lock_entries().0;

        f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(f.store.lock_entries(), (chair_ride_locks - 1, 0));
    }

    #[tokio::test]
    async fn settled_ride_is_not_charged_twice() {
        let gateway = ScriptedGateway::new(vec![Ok(()), Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;

        let first = f.service.settle(f.ride.id, &f.rider).await.unwrap();
        let second = f.service.settle(f.ride.id, &f.rider).await.unwrap();

        assert_eq!(gateway.post_calls(), 1);
        assert_eq!(first.settled_at, second.settled_at);
    }

    #[tokio::test]
    async fn only_arrived_rides_are_settled() {
        let gateway = ScriptedGateway::new(vec![Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Carrying).await;

        let err = f.service.settle(f.ride.id, &f.rider).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: RideStatus::Carrying,
                to: RideStatus::Completed
            }
        ));
        assert_eq!(gateway.post_calls(), 0);
        assert!(f.service.settlement(f.ride.id).is_none());
    }

    #[tokio::test]
    async fn only_the_rider_may_settle() {
        let gateway = ScriptedGateway::new(vec![Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;
        let stranger = RiderPrincipal {
            user_id: Uuid::new_v4(),
        };

        let err = f.service.settle(f.ride.id, &stranger).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert_eq!(gateway.post_calls(), 0);
    }

    #[tokio::test]
    async fn rider_without_payment_token_is_rejected() {
        let gateway = ScriptedGateway::new(vec![Ok(())], None);
        let f = fixture(gateway.clone(), RideStatus::Arrived).await;

        let user = f
            .store
            .insert_user(User::new("cash".to_string(), "t".to_string(), None));
        let chair = seed_chair(&f.store, 5, None).await;
        let ride = seed_ride(&f.store, user.id, Coordinate::new(0, 0), Coordinate::new(1, 1), 0);
        advance_to(&f.store, &ride, &chair, RideStatus::Arrived).await;

        let err = f
            .service
            .settle(ride.id, &RiderPrincipal { user_id: user.id })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(gateway.post_calls(), 0);
    }
}
