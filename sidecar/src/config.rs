use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use sidecar_core::queue::config::{CooldownConfig, QueueConfig, RetryConfig};

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3400")]
    pub port: u16,

    #[envconfig(from = "UPSTREAM_BASE_URL", default = "http://localhost:8787")]
    pub upstream_base_url: String,

    #[envconfig(from = "UPSTREAM_REQUEST_TIMEOUT_MS", default = "120000")]
    pub upstream_request_timeout: EnvMsDuration,

    #[envconfig(from = "REPLAY_REPORTS_DIR")]
    pub replay_reports_dir: Option<String>,

    #[envconfig(from = "ASYNC_MAX_IN_FLIGHT", default = "1")]
    pub max_in_flight: usize,

    #[envconfig(from = "ASYNC_QUEUE_MAX_DEPTH", default = "120")]
    pub queue_max_depth: usize,

    #[envconfig(from = "ASYNC_RETRY_MAX_ATTEMPTS", default = "2")]
    pub retry_max_attempts: i32,

    #[envconfig(from = "ASYNC_RETRY_BASE_MS", default = "1500")]
    pub retry_base_ms: i64,

    #[envconfig(from = "ASYNC_RETRY_MAX_DELAY_MS", default = "45000")]
    pub retry_max_delay_ms: i64,

    #[envconfig(from = "ASYNC_AUTH_COOLDOWN_MS", default = "300000")]
    pub auth_cooldown_ms: i64,

    #[envconfig(from = "ASYNC_CHALLENGE_COOLDOWN_MS", default = "90000")]
    pub challenge_cooldown_ms: i64,

    #[envconfig(from = "ASYNC_RATE_COOLDOWN_MS", default = "45000")]
    pub rate_cooldown_ms: i64,

    #[envconfig(from = "ASYNC_DEGRADED_COOLDOWN_MS", default = "15000")]
    pub degraded_cooldown_ms: i64,

    #[envconfig(from = "ASYNC_METRICS_SAMPLE_CAP", default = "500")]
    pub metrics_sample_cap: usize,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(
            self.max_in_flight,
            self.queue_max_depth,
            RetryConfig::new(self.retry_max_attempts, self.retry_base_ms, self.retry_max_delay_ms),
            CooldownConfig::new(
                self.auth_cooldown_ms,
                self.challenge_cooldown_ms,
                self.rate_cooldown_ms,
                self.degraded_cooldown_ms,
            ),
        )
    }
}
