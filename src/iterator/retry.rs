use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Decides whether a failed source open is retried, and after which delay.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` starts at 1 for the first failure. `None` gives up.
    fn next_delay(&self, attempt: u32, err: &Error) -> Option<Duration>;
}

/// Fails on the first error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _attempt: u32, _err: &Error) -> Option<Duration> {
        None
    }
}

/// Retries transient errors with exponential backoff. Permanent errors such
/// as a missing file are returned immediately.
#[derive(Debug, Clone)]
pub struct BackoffRetry {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy for BackoffRetry {
    fn next_delay(&self, attempt: u32, err: &Error) -> Option<Duration> {
        if attempt > self.max_retries || !err.is_transient() {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        Some(
            self.initial_delay
                .saturating_mul(factor)
                .min(self.max_delay),
        )
    }
}

/// Runs `open` until it succeeds or `policy` gives up.
pub fn open_with_retry<T, F>(policy: &dyn RetryPolicy, what: &str, mut open: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match open() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                match policy.next_delay(attempt, &err) {
                    Some(delay) => {
                        debug!(source = what, attempt, ?delay, error = %err, "retrying source open");
                        std::thread::sleep(delay);
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn stale() -> Error {
        Error::System {
            path: "a.gor".into(),
            source: io::Error::new(io::ErrorKind::Interrupted, "stale"),
        }
    }

    fn missing() -> Error {
        Error::Resource {
            path: "a.gor".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        }
    }

    fn quick() -> BackoffRetry {
        BackoffRetry {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_transient_error_is_retried() {
        let mut calls = 0;
        let value = open_with_retry(&quick(), "a", || {
            calls += 1;
            if calls < 3 {
                Err(stale())
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_missing_file_is_not_retried() {
        let mut calls = 0;
        let result: Result<()> = open_with_retry(&quick(), "a", || {
            calls += 1;
            Err(missing())
        });
        assert!(matches!(result, Err(Error::Resource { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<()> = open_with_retry(&quick(), "a", || {
            calls += 1;
            Err(stale())
        });
        assert!(result.is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffRetry {
            max_retries: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.next_delay(1, &stale()), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(2, &stale()), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_delay(5, &stale()), Some(Duration::from_millis(50)));
        assert_eq!(NoRetry.next_delay(1, &stale()), None);
    }
}
