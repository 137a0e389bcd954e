//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on malformed values. Every setting
//! has a default, so an empty environment yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::env::VarError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::caller::RetryPolicy;
use crate::error::{Error, Result};
use crate::limiter::RateLimits;
use crate::queue::QueueSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub limits: RateLimits,
    pub retry: RetryPolicy,
    pub queue: QueueSettings,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        ConfigFile::default().into()
    }
}

impl Config {
    /// Load configuration from `DISPATCHQ_*` environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut file = ConfigFile::default();

        override_var(&mut file.limits.max_requests_per_minute, "DISPATCHQ_MAX_REQUESTS_PER_MINUTE")?;
        override_var(&mut file.limits.max_tokens_per_minute, "DISPATCHQ_MAX_TOKENS_PER_MINUTE")?;
        override_var(&mut file.limits.window_secs, "DISPATCHQ_WINDOW_SECS")?;
        override_var(&mut file.retry.max_attempts, "DISPATCHQ_MAX_ATTEMPTS")?;
        override_var(&mut file.retry.timeout_secs, "DISPATCHQ_TIMEOUT_SECS")?;
        override_var(&mut file.retry.backoff_base_ms, "DISPATCHQ_BACKOFF_BASE_MS")?;
        override_var(&mut file.retry.backoff_multiplier, "DISPATCHQ_BACKOFF_MULTIPLIER")?;
        override_var(&mut file.retry.backoff_max_ms, "DISPATCHQ_BACKOFF_MAX_MS")?;
        override_var(&mut file.retry.jitter, "DISPATCHQ_JITTER")?;
        override_var(&mut file.queue.concurrency_capacity, "DISPATCHQ_CONCURRENCY_CAPACITY")?;
        override_var(&mut file.queue.admission_poll_ms, "DISPATCHQ_ADMISSION_POLL_MS")?;

        file.telemetry.otel_endpoint = std::env::var("OTEL_ENDPOINT").ok();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            file.telemetry.log_level = level;
        }

        let config = Config::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing tables and keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad config: {e}")))?;
        let config = Config::from(file);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML in the same shape [`from_toml_str`](Self::from_toml_str) reads.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&ConfigFile::from(self))
            .map_err(|e| Error::Config(format!("cannot render config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_requests == 0 {
            return Err(invalid("max_requests_per_minute must be at least 1"));
        }
        if self.limits.max_tokens == 0 {
            return Err(invalid("max_tokens_per_minute must be at least 1"));
        }
        if self.limits.window.is_zero() {
            return Err(invalid("window must be non-zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.retry.timeout.is_zero() {
            return Err(invalid("timeout must be non-zero"));
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return Err(invalid("backoff_multiplier must be a finite value >= 1.0"));
        }
        if self.queue.capacity == 0 {
            return Err(invalid("concurrency_capacity must be at least 1"));
        }
        if self.queue.admission_poll_interval.is_zero() {
            return Err(invalid("admission poll interval must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::Config(message.to_string())
}

fn override_var<T>(slot: &mut T, name: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            *slot = raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid value for {name}: {e}")))?;
            Ok(())
        }
        Err(VarError::NotPresent) => Ok(()),
        Err(e) => Err(Error::Config(format!("cannot read {name}: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// File representation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    limits: LimitsSection,
    retry: RetrySection,
    queue: QueueSection,
    telemetry: TelemetrySection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct LimitsSection {
    max_requests_per_minute: u64,
    max_tokens_per_minute: u64,
    window_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 1_000,
            max_tokens_per_minute: 100_000,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct RetrySection {
    max_attempts: u32,
    timeout_secs: u64,
    backoff_base_ms: u64,
    backoff_multiplier: f64,
    backoff_max_ms: u64,
    jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 60,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct QueueSection {
    concurrency_capacity: usize,
    admission_poll_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            concurrency_capacity: 10,
            admission_poll_ms: 1_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct TelemetrySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    otel_endpoint: Option<String>,
    log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        Self {
            limits: RateLimits {
                max_requests: file.limits.max_requests_per_minute,
                max_tokens: file.limits.max_tokens_per_minute,
                window: Duration::from_secs(file.limits.window_secs),
            },
            retry: RetryPolicy {
                max_attempts: file.retry.max_attempts,
                timeout: Duration::from_secs(file.retry.timeout_secs),
                base_delay: Duration::from_millis(file.retry.backoff_base_ms),
                multiplier: file.retry.backoff_multiplier,
                max_delay: Duration::from_millis(file.retry.backoff_max_ms),
                jitter: file.retry.jitter,
            },
            queue: QueueSettings {
                capacity: file.queue.concurrency_capacity,
                admission_poll_interval: Duration::from_millis(file.queue.admission_poll_ms),
            },
            otel_endpoint: file.telemetry.otel_endpoint,
            log_level: file.telemetry.log_level,
        }
    }
}

impl From<&Config> for ConfigFile {
    fn from(config: &Config) -> Self {
        Self {
            limits: LimitsSection {
                max_requests_per_minute: config.limits.max_requests,
                max_tokens_per_minute: config.limits.max_tokens,
                window_secs: config.limits.window.as_secs(),
            },
            retry: RetrySection {
                max_attempts: config.retry.max_attempts,
                timeout_secs: config.retry.timeout.as_secs(),
                backoff_base_ms: config.retry.base_delay.as_millis() as u64,
                backoff_multiplier: config.retry.multiplier,
                backoff_max_ms: config.retry.max_delay.as_millis() as u64,
                jitter: config.retry.jitter,
            },
            queue: QueueSection {
                concurrency_capacity: config.queue.capacity,
                admission_poll_ms: config.queue.admission_poll_interval.as_millis() as u64,
            },
            telemetry: TelemetrySection {
                otel_endpoint: config.otel_endpoint.clone(),
                log_level: config.log_level.clone(),
            },
        }
    }
}
