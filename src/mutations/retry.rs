//! Bounded retry with exponential backoff for idempotent store calls
use crate::error::Result;
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single backoff
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Run `f`, retrying transient failures. Any other error, or the last
    /// transient one, is returned as is.
    ///
    /// Only pass operations that are safe to repeat.
    pub fn run<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        operation,
                        e,
                        attempt,
                        max_attempts - 1,
                        backoff
                    );
                    thread::sleep(backoff);
                    backoff = Duration::from_millis(
                        ((backoff.as_millis() as f64 * self.backoff_multiplier)
                            .min(self.max_backoff.as_millis() as f64)) as u64,
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_success_on_first_attempt() {
        let calls = Cell::new(0);
        let result = fast(3).run("op", || {
            calls.set(calls.get() + 1);
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_success_after_transient_failures() {
        let calls = Cell::new(0);
        let result = fast(3).run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SyncError::TransientNetwork("flaky".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = fast(2).run("op", || {
            calls.set(calls.get() + 1);
            Err(SyncError::TransientNetwork("down".into()))
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_non_transient_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = fast(5).run("op", || {
            calls.set(calls.get() + 1);
            Err(SyncError::Validation("empty".into()))
        });
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(calls.get(), 1);
    }
}
