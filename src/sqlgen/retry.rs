//! Retry primitive with exponential backoff. The previous attempt's error
//! message is handed to the next attempt so it can adjust.

use crate::config::RetrySettings;
use crate::error::AppError;
use std::future::Future;
use std::time::Duration;

/// Single-attempt settings, used when a caller wants the operation run once
/// inside a retry-shaped flow.
pub fn single_attempt() -> RetrySettings {
    RetrySettings {
        max_attempts: 1,
        initial_delay_ms: 0,
        max_delay_ms: 0,
    }
}

/// Runs `operation` up to `settings.max_attempts` times. Each retry waits
/// `min(initial_delay * 2^(attempt - 1), max_delay)` and passes the failed
/// attempt's message in; the final attempt's error is returned as-is.
pub async fn retry_with_feedback<T, F, Fut>(
    settings: &RetrySettings,
    mut operation: F,
) -> Result<T, AppError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let attempts = settings.max_attempts.max(1);
    let mut last_error: Option<String> = None;
    let mut attempt = 1;
    loop {
        match operation(last_error.take()).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                let delay = backoff_delay(settings, attempt);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                last_error = Some(err.message().to_string());
                attempt += 1;
            }
        }
    }
}

fn backoff_delay(settings: &RetrySettings, attempt: u32) -> u64 {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    settings
        .initial_delay_ms
        .saturating_mul(factor)
        .min(settings.max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetrySettings {
        RetrySettings {
            max_attempts: attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn second_attempt_sees_first_error() {
        let calls = AtomicU32::new(0);
        let result = retry_with_feedback(&fast(2), |feedback| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt == 1 {
                    assert!(feedback.is_none());
                    Err(AppError::execution("syntax error near FROM"))
                } else {
                    assert_eq!(feedback.as_deref(), Some("syntax error near FROM"));
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn final_error_is_returned() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AppError> = retry_with_feedback(&fast(3), |_| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(AppError::execution(format!("boom {attempt}"))) }
        })
        .await;
        assert_eq!(result.unwrap_err().message(), "boom 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_attempt_never_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AppError> = retry_with_feedback(&single_attempt(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::execution("once")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delays_follow_capped_exponential_curve() {
        let settings = RetrySettings {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(backoff_delay(&settings, 1), 1000);
        assert_eq!(backoff_delay(&settings, 2), 2000);
        assert_eq!(backoff_delay(&settings, 3), 4000);
        assert_eq!(backoff_delay(&settings, 4), 5000);
        assert_eq!(backoff_delay(&settings, 64), 5000);
    }
}
