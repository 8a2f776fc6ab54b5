use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Top-level configuration, one section per concern.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub broker: BrokerConfig,
    pub booking: BookingConfig,
    pub layout: LayoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    /// `json` switches the log formatter to structured output.
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Pub/sub settings shared by the arbiter and viewer sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub namespace: String,
    pub connect_timeout_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub publish_attempts: u32,
    pub channel_buffer: usize,
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: "cinema".to_string(),
            connect_timeout_ms: 10_000,
            retry_initial_ms: 100,
            retry_max_ms: 5_000,
            publish_attempts: 5,
            channel_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    /// Client-side wait for an outcome before `BookingTimedOut`.
    pub outcome_timeout_ms: u64,
    pub hold_ttl_secs: u64,
    pub hold_sweep_interval_secs: u64,
    pub max_seats_per_request: usize,
}

impl BookingConfig {
    pub fn outcome_timeout(&self) -> Duration {
        Duration::from_millis(self.outcome_timeout_ms)
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::from_secs(self.hold_ttl_secs)
    }
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            outcome_timeout_ms: 15_000,
            hold_ttl_secs: 300,
            hold_sweep_interval_secs: 30,
            max_seats_per_request: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayoutConfig {
    /// Base URL of the showings API. Unset means every showing gets the
    /// standard generated room.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker_defaults = BrokerConfig::default();
        let booking_defaults = BookingConfig::default();

        Ok(Config {
            app: AppConfig {
                host: var_or("HOST", "0.0.0.0"),
                port: parse_or("PORT", 8000)?,
                environment: var_or("ENVIRONMENT", "development"),
                rust_log: var_or("RUST_LOG", "seat_coordinator=debug,tower_http=debug"),
                log_format: var_or("LOG_FORMAT", "text"),
            },
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                pool_size: parse_or("DB_POOL_SIZE", 20)?,
                acquire_timeout_secs: parse_or("DB_ACQUIRE_TIMEOUT_SECONDS", 5)?,
            },
            redis: RedisConfig {
                url: required("REDIS_URL")?,
            },
            broker: BrokerConfig {
                namespace: var_or("BROKER_NAMESPACE", &broker_defaults.namespace),
                connect_timeout_ms: parse_or("BROKER_CONNECT_TIMEOUT_MS", broker_defaults.connect_timeout_ms)?,
                retry_initial_ms: parse_or("BROKER_RETRY_INITIAL_MS", broker_defaults.retry_initial_ms)?,
                retry_max_ms: parse_or("BROKER_RETRY_MAX_MS", broker_defaults.retry_max_ms)?,
                publish_attempts: parse_or("BROKER_PUBLISH_ATTEMPTS", broker_defaults.publish_attempts)?,
                channel_buffer: parse_or("BROKER_CHANNEL_BUFFER", broker_defaults.channel_buffer)?,
            },
            booking: BookingConfig {
                outcome_timeout_ms: parse_or("BOOKING_OUTCOME_TIMEOUT_MS", booking_defaults.outcome_timeout_ms)?,
                hold_ttl_secs: parse_or("HOLD_TTL_SECONDS", booking_defaults.hold_ttl_secs)?,
                hold_sweep_interval_secs: parse_or(
                    "HOLD_SWEEP_INTERVAL_SECONDS",
                    booking_defaults.hold_sweep_interval_secs,
                )?,
                max_seats_per_request: parse_or("MAX_SEATS_PER_REQUEST", booking_defaults.max_seats_per_request)?,
            },
            layout: LayoutConfig {
                base_url: env::var("LAYOUT_API_URL").ok().filter(|s| !s.is_empty()),
                timeout_secs: parse_or("LAYOUT_API_TIMEOUT_SECONDS", 5)?,
            },
        })
    }
}

fn var_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_and_reports_bad_values() {
        assert_eq!(parse_or::<u16>("SEAT_COORDINATOR_TEST_UNSET_PORT", 8000).unwrap(), 8000);

        env::set_var("SEAT_COORDINATOR_TEST_BAD_PORT", "eighty");
        let err = parse_or::<u16>("SEAT_COORDINATOR_TEST_BAD_PORT", 8000).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SEAT_COORDINATOR_TEST_BAD_PORT", .. }));
        env::remove_var("SEAT_COORDINATOR_TEST_BAD_PORT");
    }

    #[test]
    fn durations_come_from_millis() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.connect_timeout(), Duration::from_secs(10));
        assert_eq!(BookingConfig::default().hold_ttl(), Duration::from_secs(300));
    }
}
