use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_runs_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub pending_rides: IntGauge,
    pub position_reports_total: IntCounter,
    pub ride_status_transitions_total: IntCounterVec,
    pub payment_attempts_total: IntCounterVec,
    pub settlements_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_runs_total = IntCounterVec::new(
            Opts::new("dispatch_runs_total", "Dispatch runs by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_runs_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of a single dispatch run in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let pending_rides = IntGauge::new("pending_rides", "Rides waiting for a chair")
            .expect("valid pending_rides metric");

        let position_reports_total =
            IntCounter::new("position_reports_total", "Chair position reports ingested")
                .expect("valid position_reports_total metric");

        let ride_status_transitions_total = IntCounterVec::new(
            Opts::new(
                "ride_status_transitions_total",
                "Ride status events appended by target status",
            ),
            &["status"],
        )
        .expect("valid ride_status_transitions_total metric");

        let payment_attempts_total = IntCounterVec::new(
            Opts::new("payment_attempts_total", "Payment gateway attempts by result"),
            &["result"],
        )
        .expect("valid payment_attempts_total metric");

        let settlements_total = IntCounterVec::new(
            Opts::new("settlements_total", "Fare settlements by outcome"),
            &["outcome"],
        )
        .expect("valid settlements_total metric");

        registry
            .register(Box::new(dispatch_runs_total.clone()))
            .expect("register dispatch_runs_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(pending_rides.clone()))
            .expect("register pending_rides");
        registry
            .register(Box::new(position_reports_total.clone()))
            .expect("register position_reports_total");
        registry
            .register(Box::new(ride_status_transitions_total.clone()))
            .expect("register ride_status_transitions_total");
        registry
            .register(Box::new(payment_attempts_total.clone()))
            .expect("register payment_attempts_total");
        registry
            .register(Box::new(settlements_total.clone()))
            .expect("register settlements_total");

        Self {
            registry,
            dispatch_runs_total,
            dispatch_latency_seconds,
            pending_rides,
            position_reports_total,
            ride_status_transitions_total,
            payment_attempts_total,
            settlements_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
