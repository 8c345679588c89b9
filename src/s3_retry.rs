use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Markers of errors worth another attempt: network trouble, throttling, 5xx.
const TRANSIENT: &[&str] = &[
    "TimeoutError",
    "DispatchFailure",
    "ConnectorError",
    "ConnectionReset",
    "429",
    "TooManyRequests",
    "SlowDown",
    "500",
    "502",
    "503",
    "504",
    "InternalError",
    "ServiceUnavailable",
];

/// Markers of errors that will not go away by retrying. Checked first.
const PERMANENT: &[&str] = &[
    "NoSuchKey",
    "NotFound",
    "AccessDenied",
    "InvalidRequest",
    "NoSuchBucket",
];

/// Classify an object-store error by its debug rendering. Unknown errors are
/// not retried.
pub fn is_transient<E: Debug>(error: &E) -> bool {
    let rendered = format!("{:?}", error);
    if PERMANENT.iter().any(|m| rendered.contains(m)) {
        return false;
    }
    TRANSIENT.iter().any(|m| rendered.contains(m))
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `retry_count` total attempts (at least one), `delay_ms` between them.
    pub fn new(retry_count: u32, delay_ms: u64) -> Self {
        Self {
            attempts: retry_count.max(1),
            delay: Duration::from_millis(delay_ms),
        }
    }

    pub async fn run<F, Fut, T, E>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(v) => {
                    if attempt > 1 {
                        debug!("S3 {} succeeded on attempt {}/{}", name, attempt, self.attempts);
                    }
                    return Ok(v);
                }
                Err(e) if attempt < self.attempts && is_transient(&e) => {
                    warn!(
                        "⚠️  S3 {} failed on attempt {}/{}: {:?}. Retrying in {:?}",
                        name, attempt, self.attempts, e, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classification() {
        assert!(is_transient(&"DispatchFailure(ConnectorError)"));
        assert!(is_transient(&"status: 503 Service Unavailable"));
        assert!(!is_transient(&"NoSuchKey: artefacts/x.tar.gz"));
        assert!(!is_transient(&"AccessDenied"));
        assert!(!is_transient(&"something odd"));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 1);
        let out: Result<u32, String> = policy
            .run("get", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err("TimeoutError".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_and_exhaustion_stop() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 1);
        let out: Result<(), String> = policy
            .run("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("NoSuchKey".to_string())
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let out: Result<(), String> = RetryPolicy::new(2, 1)
            .run("put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("503".to_string())
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
