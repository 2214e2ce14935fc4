//! Fixed-delay retry around a whole unit of work

use std::fmt::Display;
use std::time::Duration;

/// How hard to try before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    ///
    /// Default: 3. Zero is treated as one: the work always runs at least once.
    pub max_attempts: u32,
    /// Constant pause between attempts
    ///
    /// Default: 100ms
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Run `work` until it succeeds or `config.max_attempts` is used up
///
/// Every attempt starts from scratch: `work` is called again, nothing from a
/// failed attempt is reused. The last attempt's error is returned.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut work: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts = 0;
    loop {
        match work().await {
            Ok(t) => return Ok(t),
            Err(e) => {
                attempts += 1;
                if attempts >= config.max_attempts {
                    log::debug!("giving up after {attempts} attempt(s)");
                    return Err(e);
                }
                log::warn!(
                    "attempt {attempts}/{} failed, retrying in {:?}: {e}",
                    config.max_attempts,
                    config.delay
                );
            }
        }
        tokio::time::sleep(config.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::Instant;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let config = RetryConfig::default();
        let calls = Cell::new(0);
        let start = Instant::now();

        let res: Result<&str, String> = retry(&config, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(format!("fail {n}"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls.get(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error() {
        let config = RetryConfig::new(4, Duration::from_millis(10));
        let calls = Cell::new(0);

        let res: Result<(), String> = retry(&config, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { Err(format!("fail {n}")) }
        })
        .await;

        assert_eq!(res.unwrap_err(), "fail 4");
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_does_not_sleep() {
        let start = Instant::now();
        let res: Result<u8, String> = retry(&RetryConfig::default(), || async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_runs_once() {
        let config = RetryConfig::new(0, Duration::from_millis(10));
        let calls = Cell::new(0);
        let res: Result<(), &str> = retry(&config, || {
            calls.set(calls.get() + 1);
            async { Err("nope") }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.get(), 1);
    }
}
