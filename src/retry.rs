//! Retry and poll-wait utilities.
//!
//! Two waiting disciplines are used against the provider API:
//!
//! - [`retry_with_backoff`] for ordinary calls that may fail transiently
//!   (rate limits, eventual-consistency lag), with exponential backoff and
//!   jitter to avoid thundering herds.
//! - [`poll_until`] for long provider state transitions (NAT gateway
//!   becoming available, instances booting, targets turning healthy):
//!   a fixed poll interval bounded by an overall timeout, on the order of
//!   minutes, checking a cooperative cancellation flag between probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::{Error, Result};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Configuration for bounded fixed-interval polling of slow provider
/// operations. The defaults match the provider operation timeouts used
/// for gateway creation and instance boot waits.
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Overall bound on the wait
    pub timeout: Duration,
    /// Interval between probes
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(5),
        }
    }
}

impl PollConfig {
    /// Shorter poll used in unit tests
    pub fn fast() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(10),
        }
    }
}

/// Cooperative cancellation flag shared between the caller and
/// long-running waits. Cloning shares the underlying flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; in-flight waits notice at their next probe
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true once cancellation has been requested
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns `Err(Error::Canceled)` once cancellation has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Only transient errors (per [`Error::is_transient`]) are retried;
/// anything else is returned immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the nominal delay.
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Poll `probe` at a fixed interval until it reports completion, the
/// timeout elapses, or the caller cancels.
///
/// The probe returns `Ok(Some(value))` when the awaited condition holds,
/// `Ok(None)` to keep waiting, or `Err` to abort the wait (used for
/// provider states the engine did not put the resource in).
pub async fn poll_until<F, Fut, T>(
    config: &PollConfig,
    cancel: &CancelFlag,
    what: &str,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + config.timeout;

    loop {
        cancel.check()?;

        if let Some(value) = probe().await? {
            return Ok(value);
        }

        if tokio::time::Instant::now() + config.interval > deadline {
            return Err(Error::Timeout(what.to_string()));
        }

        tokio::time::sleep(config.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };

        let result = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::provider("throttled"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_fatal_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> =
            retry_with_backoff(&RetryConfig::default(), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::conflict("not ours"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_until_returns_probe_value() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let value = poll_until(&PollConfig::fast(), &CancelFlag::new(), "thing", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(None)
                } else {
                    Ok(Some("ready"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "ready");
    }

    #[tokio::test]
    async fn poll_until_times_out() {
        let config = PollConfig {
            timeout: Duration::from_millis(30),
            interval: Duration::from_millis(10),
        };

        let result: Result<()> =
            poll_until(&config, &CancelFlag::new(), "never", || async { Ok(None) }).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn poll_until_observes_cancellation() {
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result: Result<()> =
            poll_until(&PollConfig::fast(), &cancel, "never", || async { Ok(None) }).await;

        assert!(matches!(result, Err(Error::Canceled)));
    }
}
