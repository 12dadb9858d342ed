//! Engine configuration.
//!
//! All knobs deserialize from YAML with sensible defaults, so an empty
//! document yields a runnable serial engine. Durations are human strings
//! ("50ms", "5s", "1m 30s").
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use tokio::time::Duration;

use crate::retry::{ErrorHandlingMode, RetryMode};
use crate::Error;

/// Deserialize a duration from a string like "10s", "5m", "1h", etc.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration::parse(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional duration from a string like "10s", "5m", "1h", etc.
pub(crate) fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => parse_duration::parse(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Execution strategy moving messages from source to handler to sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parallelism {
    /// Strict FIFO, one message at a time.
    #[default]
    Serial,
    /// Pipelined stages with batched sink commits.
    Concurrent,
    /// Unordered parallel dispatch with per-message release, for sources that
    /// require a per-message response.
    Rpc,
}

/// Retry policy for a class of operations (dispatch or sink).
///
/// # Example Configuration
///
/// ```yaml
/// sink_retry:
///   mode: LogAndRetryOrFail
///   retries: 5
///   retry_mode: Exponential
///   retry_interval: 50ms
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// What to do when an operation fails.
    pub mode: ErrorHandlingMode,
    /// Number of re-attempts after the first failure; ignored by modes that
    /// never retry or retry forever.
    pub retries: u64,
    /// Shape of the wait between attempts.
    pub retry_mode: RetryMode,
    /// Base wait between attempts.
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,
    /// Upper bound on the wait between attempts.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_retry_interval: Duration,
    /// Exponent base for [RetryMode::Exponential]; values at or below 1 are
    /// rewritten to 2, and [RetryMode::Linear] forces 1.
    pub exponent_base: f64,
    /// Whether to multiply each wait by a random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            mode: ErrorHandlingMode::LogAndRetryOrFail,
            retries: 3,
            retry_mode: RetryMode::Exponential,
            retry_interval: Duration::from_millis(50),
            max_retry_interval: Duration::from_secs(5),
            exponent_base: 2.0,
            randomize: true,
        }
    }
}

/// Top-level engine configuration.
///
/// ```
/// use conveyor::config::{EngineConfig, Parallelism};
/// use std::str::FromStr;
///
/// let config = EngineConfig::from_str(
///     "parallelism: Concurrent\nmaximum_batch_size: 50\nbatch_linger: 100ms",
/// )
/// .unwrap();
/// assert_eq!(config.parallelism, Parallelism::Concurrent);
/// assert_eq!(config.maximum_batch_size, 50);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution strategy.
    pub parallelism: Parallelism,
    /// Bounded capacity of the input queue; the engine's only backpressure
    /// signal.
    pub input_queue_capacity: usize,
    /// Bounded capacity of the queue between processing and sink stages.
    pub output_queue_capacity: usize,
    /// A drained output queue flushes once a batch reaches this size.
    pub minimum_batch_size: usize,
    /// A batch flushes unconditionally at this size.
    pub maximum_batch_size: usize,
    /// A non-empty batch flushes after waiting this long.
    #[serde(deserialize_with = "deserialize_duration")]
    pub batch_linger: Duration,
    /// Cap on concurrently running handlers under [Parallelism::Rpc].
    pub max_parallel_rpc_requests: usize,
    /// Capacity of the state cache wrapped around the state provider; 0
    /// disables caching.
    pub state_cache_capacity: usize,
    /// Optional time-to-live for state cache entries.
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub state_cache_ttl: Option<Duration>,
    /// Retry policy applied around handler dispatch.
    pub dispatch_retry: RetryConfig,
    /// Retry policy applied around sink commits.
    pub sink_retry: RetryConfig,
    /// Interval at which queue-depth gauges are emitted.
    #[serde(deserialize_with = "deserialize_duration")]
    pub metrics_interval: Duration,
    /// Grace period for draining in-flight work on shutdown.
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            parallelism: Parallelism::Serial,
            input_queue_capacity: 100,
            output_queue_capacity: 100,
            minimum_batch_size: 1,
            maximum_batch_size: 100,
            batch_linger: Duration::from_millis(100),
            max_parallel_rpc_requests: num_cpus::get() * 32,
            state_cache_capacity: 1000,
            state_cache_ttl: None,
            dispatch_retry: RetryConfig {
                mode: ErrorHandlingMode::LogAndFail,
                ..RetryConfig::default()
            },
            sink_retry: RetryConfig::default(),
            metrics_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl FromStr for EngineConfig {
    type Err = Error;

    fn from_str(conf: &str) -> Result<Self, Self::Err> {
        let config: EngineConfig = serde_yaml::from_str(conf)?;
        config.validate()?;
        Ok(config)
    }
}

impl EngineConfig {
    /// Checks internal consistency of the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.input_queue_capacity == 0 {
            return Err(Error::ConfigFailedValidation(
                "input_queue_capacity must be at least 1".into(),
            ));
        }
        if self.output_queue_capacity == 0 {
            return Err(Error::ConfigFailedValidation(
                "output_queue_capacity must be at least 1".into(),
            ));
        }
        if self.maximum_batch_size == 0 {
            return Err(Error::ConfigFailedValidation(
                "maximum_batch_size must be at least 1".into(),
            ));
        }
        if self.minimum_batch_size > self.maximum_batch_size {
            return Err(Error::ConfigFailedValidation(format!(
                "minimum_batch_size {} exceeds maximum_batch_size {}",
                self.minimum_batch_size, self.maximum_batch_size
            )));
        }
        if self.max_parallel_rpc_requests == 0 {
            return Err(Error::ConfigFailedValidation(
                "max_parallel_rpc_requests must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
