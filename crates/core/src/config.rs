//! Scheduler configuration.
//!
//! Every knob has a documented default and can be overridden through
//! environment variables. Nothing in the scheduler bakes these values
//! into its logic.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Default ComfyUI base URL.
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8188";

/// Default global ceiling on simultaneously processing requests. Sized for
/// the VRAM of a single consumer GPU, so treat it as a hard limit.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 2;

/// Default per-request timeout measured from the first poll.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Default interval between backend queue polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default concurrency limit applied to a batch when the caller does not
/// pick one.
pub const DEFAULT_BATCH_CONCURRENCY_LIMIT: usize = 2;

/// Default directory for fetched artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "assets/animations/generated";

/// Default broadcast capacity for scheduler events.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime configuration for the scheduler and its backend client.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Backend base URL (e.g. `http://host:8188`).
    pub backend_url: String,
    /// Global ceiling on requests in `Processing`.
    pub max_concurrent_requests: usize,
    /// How long a submitted request may stay non-terminal on the backend.
    pub request_timeout: Duration,
    /// Delay between queue polls for one request.
    pub poll_interval: Duration,
    /// Fallback concurrency limit for batches.
    pub batch_concurrency_limit: usize,
    /// Directory that receives fetched artifacts.
    pub output_dir: PathBuf,
    /// Capacity of the scheduler event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            batch_concurrency_limit: DEFAULT_BATCH_CONCURRENCY_LIMIT,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                       |
    /// |---------------------------|-------------------------------|
    /// | `COMFYUI_URL`             | `http://127.0.0.1:8188`       |
    /// | `MAX_CONCURRENT_REQUESTS` | `2`                           |
    /// | `REQUEST_TIMEOUT_SECS`    | `300`                         |
    /// | `POLL_INTERVAL_SECS`      | `5`                           |
    /// | `BATCH_CONCURRENCY_LIMIT` | `2`                           |
    /// | `OUTPUT_DIR`              | `assets/animations/generated` |
    /// | `EVENT_CHANNEL_CAPACITY`  | `256`                         |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. `from_env` is the
    /// production entry point; tests feed a map instead of mutating the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            backend_url: lookup("COMFYUI_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.backend_url),
            max_concurrent_requests: parse_or(
                &lookup,
                "MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            )?,
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            batch_concurrency_limit: parse_or(
                &lookup,
                "BATCH_CONCURRENCY_LIMIT",
                defaults.batch_concurrency_limit,
            )?,
            output_dir: lookup("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            event_channel_capacity: parse_or(
                &lookup,
                "EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.backend_url.is_empty() {
            return Err(CoreError::Validation(
                "Backend URL must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(CoreError::Validation(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.batch_concurrency_limit == 0 {
            return Err(CoreError::Validation(
                "batch_concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(CoreError::Validation(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(CoreError::Validation(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CoreError::Validation(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            CoreError::Validation(format!("{key} has an invalid value: \"{raw}\""))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.max_concurrent_requests, 2);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_concurrency_limit, 2);
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
    }

    #[test]
    fn overrides_are_applied() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[
            ("COMFYUI_URL", "http://gpu-box:8188/"),
            ("MAX_CONCURRENT_REQUESTS", "4"),
            ("REQUEST_TIMEOUT_SECS", "60"),
            ("POLL_INTERVAL_SECS", "1"),
            ("OUTPUT_DIR", "/tmp/out"),
        ]))
        .unwrap();
        assert_eq!(config.backend_url, "http://gpu-box:8188");
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn unparseable_value_is_validation_error() {
        let result =
            SchedulerConfig::from_lookup(lookup_from(&[("POLL_INTERVAL_SECS", "soon")]));
        assert_matches!(result, Err(CoreError::Validation(msg)) if msg.contains("POLL_INTERVAL_SECS"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let result =
            SchedulerConfig::from_lookup(lookup_from(&[("MAX_CONCURRENT_REQUESTS", "0")]));
        assert_matches!(result, Err(CoreError::Validation(_)));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let config = SchedulerConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
