//! Retry policies for handler dispatch and sink commits.
//!
//! A [Retrier] wraps an async body and re-runs it according to an
//! [ErrorHandlingMode]. The body receives a [RetryContext] through which it
//! can inspect attempt accounting, bail out of further attempts, or override
//! the next wait interval.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::Error;

/// What to do when an operation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorHandlingMode {
    /// Log and swallow the error; no retries.
    LogAndContinue,
    /// Log and retry forever.
    LogAndRetry,
    /// Log and surface the error; no retries.
    #[default]
    LogAndFail,
    /// Log, retry up to the configured count, then swallow.
    LogAndRetryOrContinue,
    /// Log, retry up to the configured count, then surface.
    LogAndRetryOrFail,
}

/// Shape of the wait between retry attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryMode {
    /// Constant wait; the exponent base is ignored.
    Linear,
    /// Wait grows by `exponent_base` per attempt.
    #[default]
    Exponential,
}

/// Disposition once attempts are exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exhausted {
    /// Surface the final error.
    Fail,
    /// Swallow the final error.
    Continue,
}

#[derive(Debug, Default)]
struct RetryInner {
    bailed: Option<String>,
    next_interval_override: Option<Duration>,
}

/// Per-run context handed to a retried body.
///
/// Cloning is cheap; clones share the bail flag and interval override, so a
/// context can be injected into nested components (dispatch contexts, sinks)
/// that need to stop the retry loop.
#[derive(Clone, Debug)]
pub struct RetryContext {
    current_attempt: u64,
    max_attempts: Option<u64>,
    inner: Arc<Mutex<RetryInner>>,
}

impl RetryContext {
    pub(crate) fn new(current_attempt: u64, max_attempts: Option<u64>) -> Self {
        RetryContext {
            current_attempt,
            max_attempts,
            inner: Arc::new(Mutex::new(RetryInner::default())),
        }
    }

    /// A detached context for call sites outside a retry loop (single
    /// attempt, no retries).
    pub fn standalone() -> Self {
        RetryContext::new(1, Some(1))
    }

    /// The 1-based attempt number of the current run.
    pub fn current_attempt(&self) -> u64 {
        self.current_attempt
    }

    /// Total attempts the policy allows; `None` means unbounded.
    pub fn max_attempts(&self) -> Option<u64> {
        self.max_attempts
    }

    /// Whether `bail` has been called.
    pub fn has_bailed(&self) -> bool {
        self.inner.lock().map(|g| g.bailed.is_some()).unwrap_or(false)
    }

    /// Stops the retry loop: no further attempts occur even if attempts
    /// remain.
    pub fn bail(&self, error: &Error) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard.bailed.is_none() {
                guard.bailed = Some(error.to_string());
            }
        }
    }

    /// Whether the current attempt is the last one the policy allows.
    pub fn is_final_attempt(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.current_attempt >= max,
            None => false,
        }
    }

    /// One-shot override for the wait before the next attempt.
    pub fn set_next_retry_interval(&self, interval: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.next_interval_override = Some(interval);
        }
    }

    fn take_interval_override(&self) -> Option<Duration> {
        self.inner
            .lock()
            .ok()
            .and_then(|mut g| g.next_interval_override.take())
    }
}

/// Executes async bodies under a [RetryConfig].
#[derive(Clone, Debug)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    /// Builds a retrier from a policy.
    pub fn new(config: RetryConfig) -> Self {
        Retrier { config }
    }

    /// Total attempts the mode allows; `None` means retry forever.
    pub fn max_attempts(&self) -> Option<u64> {
        match self.config.mode {
            ErrorHandlingMode::LogAndFail | ErrorHandlingMode::LogAndContinue => Some(1),
            ErrorHandlingMode::LogAndRetry => None,
            ErrorHandlingMode::LogAndRetryOrFail | ErrorHandlingMode::LogAndRetryOrContinue => {
                Some(self.config.retries.saturating_add(1))
            }
        }
    }

    /// Disposition once attempts are exhausted.
    pub fn on_exhausted(&self) -> Exhausted {
        match self.config.mode {
            ErrorHandlingMode::LogAndContinue | ErrorHandlingMode::LogAndRetryOrContinue => {
                Exhausted::Continue
            }
            ErrorHandlingMode::LogAndFail
            | ErrorHandlingMode::LogAndRetry
            | ErrorHandlingMode::LogAndRetryOrFail => Exhausted::Fail,
        }
    }

    /// Creates the context for the given 1-based attempt.
    pub fn context(&self, attempt: u64) -> RetryContext {
        RetryContext::new(attempt, self.max_attempts())
    }

    /// The wait between the given 1-based attempt and the next one:
    /// `min(random × retry_interval × base^(attempt-1), max_retry_interval)`
    /// where `random ∈ [1, 2)` when randomization is enabled.
    pub fn interval_for(&self, attempt: u64) -> Duration {
        let base = self.effective_base();
        let exponent = attempt.saturating_sub(1).min(u32::MAX as u64) as i32;
        let factor = if self.config.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        let millis = self.config.retry_interval.as_millis() as f64 * base.powi(exponent) * factor;
        let capped = millis.min(self.config.max_retry_interval.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Effective exponent base: 1 under [RetryMode::Linear], and bases at or
    /// below 1 are rewritten to 2 under [RetryMode::Exponential].
    pub fn effective_base(&self) -> f64 {
        match self.config.retry_mode {
            RetryMode::Linear => 1.0,
            RetryMode::Exponential => {
                if self.config.exponent_base <= 1.0 {
                    2.0
                } else {
                    self.config.exponent_base
                }
            }
        }
    }

    /// Waits out the interval before the next attempt, honoring any one-shot
    /// override set on the context.
    pub async fn wait(&self, ctx: &RetryContext) {
        let interval = ctx
            .take_interval_override()
            .unwrap_or_else(|| self.interval_for(ctx.current_attempt()));
        tokio::time::sleep(interval).await;
    }

    /// Runs `body` under this policy. Returns `Ok(Some(value))` on success,
    /// `Ok(None)` when the error was swallowed by a continue mode, and
    /// `Err` when the policy surfaces the failure (or the body bailed).
    pub async fn retry<T, F, Fut>(&self, mut body: F) -> Result<Option<T>, Error>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let max = self.max_attempts();
        let mut attempt: u64 = 1;

        loop {
            let ctx = RetryContext::new(attempt, max);
            match body(ctx.clone()).await {
                Ok(value) => return Ok(Some(value)),
                Err(error) => {
                    if ctx.has_bailed() {
                        debug!(attempt, error = %error, "retry body bailed");
                        return Err(error);
                    }
                    let exhausted = match max {
                        Some(m) => attempt >= m,
                        None => false,
                    };
                    if exhausted {
                        return match self.on_exhausted() {
                            Exhausted::Fail => Err(error),
                            Exhausted::Continue => {
                                warn!(attempt, error = %error, "swallowing error after final attempt");
                                Ok(None)
                            }
                        };
                    }
                    debug!(attempt, error = %error, "attempt failed, retrying");
                    self.wait(&ctx).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}
