use std::time::Duration;

/// Retry a function with exponential backoff
///
/// # Arguments
/// * `f` - The function to retry
/// * `max_retries` - Maximum number of attempts (at least one is made)
/// * `base_delay_ms` - Initial delay in milliseconds (doubles each retry)
/// * `operation_name` - Human-readable name for logging
pub fn retry_with_backoff<F, T, E>(
    mut f: F,
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let attempts = max_retries.max(1);
    let mut attempt = 1;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(e) if attempt < attempts => {
                let delay_ms = base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = attempts,
                    delay_ms,
                    error = %e,
                    "Operation failed, retrying"
                );
                std::thread::sleep(Duration::from_millis(delay_ms));
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    operation = operation_name,
                    attempts,
                    error = %e,
                    "Operation failed, giving up"
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = retry_with_backoff(
            || {
                calls += 1;
                if calls < 3 { Err(format!("attempt {calls}")) } else { Ok(calls) }
            },
            5,
            1,
            "flaky",
        );
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_returns_last_error() {
        let mut calls = 0;
        let result: Result<(), String> = retry_with_backoff(
            || {
                calls += 1;
                Err(format!("attempt {calls}"))
            },
            3,
            1,
            "broken",
        );
        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_zero_retries_still_tries_once() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            || {
                calls += 1;
                Err("nope")
            },
            0,
            1,
            "once",
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
