use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub payment_gateway_url: String,
    pub initial_fare: i64,
    pub fare_per_distance: i64,
    pub payment_max_retries: u32,
    pub payment_base_delay_ms: u64,
    pub dispatch_interval_ms: u64,
    pub notification_interval_ms: u64,
    pub cache_max_cost: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            log_level: "info".to_string(),
            payment_gateway_url: "http://localhost:12345".to_string(),
            initial_fare: 500,
            fare_per_distance: 100,
            payment_max_retries: 5,
            payment_base_delay_ms: 1000,
            dispatch_interval_ms: 500,
            notification_interval_ms: 500,
            cache_max_cost: 10_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            payment_gateway_url: env::var("PAYMENT_GATEWAY_URL")
                .unwrap_or(defaults.payment_gateway_url),
            initial_fare: parse_or_default("INITIAL_FARE", defaults.initial_fare)?,
            fare_per_distance: parse_or_default("FARE_PER_DISTANCE", defaults.fare_per_distance)?,
            payment_max_retries: parse_or_default(
                "PAYMENT_MAX_RETRIES",
                defaults.payment_max_retries,
            )?,
            payment_base_delay_ms: parse_or_default(
                "PAYMENT_BASE_DELAY_MS",
                defaults.payment_base_delay_ms,
            )?,
            dispatch_interval_ms: parse_or_default(
                "DISPATCH_INTERVAL_MS",
                defaults.dispatch_interval_ms,
            )?,
            notification_interval_ms: parse_or_default(
                "NOTIFICATION_INTERVAL_MS",
                defaults.notification_interval_ms,
            )?,
            cache_max_cost: parse_or_default("CACHE_MAX_COST", defaults.cache_max_cost)?,
        })
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn notification_interval(&self) -> Duration {
        Duration::from_millis(self.notification_interval_ms)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
