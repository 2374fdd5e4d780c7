use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Interval between poll attempts. The gated dependency is expected to come
/// up within a few seconds, so the interval is fixed rather than adaptive.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Health checker trait for gated dependencies.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Check if the dependency is ready. `Ok(false)` and `Err(_)` are both
    /// "not ready yet" from the gate's point of view.
    async fn check(&self) -> Result<bool>;

    /// Human-readable target, used in timeout errors.
    fn target(&self) -> &str;
}

/// Poll a checker at a fixed interval until it reports healthy or the overall
/// timeout elapses.
///
/// Any successful check resolves immediately. A transport error, non-success
/// status, or per-attempt timeout schedules the next attempt after
/// `interval`. Exceeding `timeout` overall yields [`Error::HealthTimeout`]
/// naming the elapsed duration.
pub async fn wait_until_healthy<C: HealthChecker + ?Sized>(
    checker: &C,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match checker.check().await {
            Ok(true) => {
                tracing::debug!(
                    "'{}' became healthy after {} attempt(s) in {:?}",
                    checker.target(),
                    attempts,
                    started.elapsed()
                );
                return Ok(());
            }
            Ok(false) => {
                tracing::trace!("'{}' not ready (attempt {})", checker.target(), attempts);
            }
            Err(e) => {
                tracing::trace!(
                    "'{}' health probe failed (attempt {}): {}",
                    checker.target(),
                    attempts,
                    e
                );
            }
        }

        if Instant::now() + interval > deadline {
            return Err(Error::HealthTimeout {
                url: checker.target().to_string(),
                elapsed_ms: started.elapsed().as_millis(),
            });
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Checker that becomes healthy after a fixed number of attempts.
    struct FlakyChecker {
        healthy_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthChecker for FlakyChecker {
        async fn check(&self) -> Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n >= self.healthy_after)
        }

        fn target(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_first_success() {
        let checker = FlakyChecker {
            healthy_after: 1,
            calls: AtomicU32::new(0),
        };
        wait_until_healthy(&checker, Duration::from_secs(5), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_at_fixed_interval_until_healthy() {
        let checker = FlakyChecker {
            healthy_after: 4,
            calls: AtomicU32::new(0),
        };
        let started = Instant::now();
        wait_until_healthy(&checker, Duration::from_secs(5), Duration::from_millis(500))
            .await
            .unwrap();
        // Three sleeps of 500ms before the fourth (successful) attempt.
        assert_eq!(checker.calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_elapsed_duration() {
        let checker = FlakyChecker {
            healthy_after: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let err = wait_until_healthy(
            &checker,
            Duration::from_millis(2000),
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();

        match err {
            Error::HealthTimeout { url, elapsed_ms } => {
                assert_eq!(url, "flaky");
                assert!(elapsed_ms >= 1500, "elapsed was {}ms", elapsed_ms);
            }
            other => panic!("expected HealthTimeout, got {:?}", other),
        }
    }
}
