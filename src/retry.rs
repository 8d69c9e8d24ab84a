//! Exponential backoff with jitter for retryable cleanup side-effects.
//!
//! State updates (the kill switch's status transition) never retry -- the
//! first successful state change wins. This module only wraps the cleanup
//! calls (workflow cancel, container stop, etc).

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_percent: 10.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the `attempt`-th retry (0-indexed: the delay before the
    /// first retry after the initial failed attempt).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        let jitter_frac = self.jitter_percent / 100.0;
        let jitter = rand::thread_rng().gen_range(-jitter_frac..=jitter_frac);
        let jittered_ms = (capped_ms * (1.0 + jitter)).max(0.0);
        Duration::from_millis(jittered_ms as u64)
    }
}

/// Retries `f` (an async cleanup side-effect) up to `cfg.max_retries` times,
/// only when `is_retryable` says the error qualifies. Returns the last
/// error if every attempt is exhausted.
pub async fn retry_cleanup<T, E, F, Fut, R>(cfg: &RetryConfig, is_retryable: R, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < cfg.max_retries && is_retryable(&e) => {
                tokio::time::sleep(cfg.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_is_capped() {
        let cfg = RetryConfig {
            jitter_percent: 0.0,
            ..Default::default()
        };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(400));
        // 100 * 2^10 would be way over the 5s cap.
        assert_eq!(cfg.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_percent() {
        let cfg = RetryConfig {
            jitter_percent: 10.0,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = cfg.delay_for(0).as_millis() as f64;
            assert!((90.0..=110.0).contains(&d), "delay {d} out of jitter range");
        }
    }

    #[tokio::test]
    async fn retries_up_to_max_then_gives_up() {
        let cfg = RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            max_retries: 2,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_cleanup(
            &cfg,
            |_: &&str| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
        )
        .await;
        assert!(result.is_err());
        // Initial attempt + 2 retries = 3 calls.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let cfg = RetryConfig::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_cleanup(&cfg, |_: &&str| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
