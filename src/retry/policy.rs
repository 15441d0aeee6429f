//! Retry Mechanism Module
//!
//! Bounded retries with exponential backoff and jitter for gateway tool
//! invocations. Only outcomes that report themselves as retryable are
//! repeated; hard errors end the loop immediately.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

use crate::tools::ToolInvocationResult;

/// An outcome that may ask to be attempted again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ToolInvocationResult {
    fn is_retryable(&self) -> bool {
        self.failure_kind().is_some_and(|kind| kind.is_retryable())
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier (for exponential backoff)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub use_jitter: bool,
    /// Maximum jitter percentage (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Set maximum attempts (at least one attempt is always made)
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    pub const fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Set jitter factor
    pub const fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay after the given zero-based attempt
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base_delay.min(self.max_delay.as_millis() as f64).max(0.0);
        let delay = Duration::from_millis(capped as u64);

        if self.use_jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let jitter_range = delay.as_millis() as f64 * self.jitter_factor;
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let new_delay = delay.as_millis() as f64 + jitter;
        Duration::from_millis(new_delay.max(0.0) as u64).min(self.max_delay)
    }
}

/// Final value of a retried operation plus how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Retry executor that handles the actual retry logic
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it yields a non-retryable value, an error, or the
    /// attempt budget is spent. The last value is returned either way.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<Attempted<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        T: Retryable,
    {
        let mut attempt = 0;
        loop {
            let value = operation(attempt).await?;
            let attempts = attempt + 1;

            if !value.is_retryable() || attempts >= self.policy.max_attempts {
                return Ok(Attempted { value, attempts });
            }

            let delay = self.policy.calculate_delay(attempt);
            tracing::warn!(
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "retryable outcome; backing off"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}
