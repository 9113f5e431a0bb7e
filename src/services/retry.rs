use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{CanvasError, CanvasResult};

/// Fixed-delay retry with a per-attempt timeout. Only transient failures are
/// retried; anything else is returned as-is on the first occurrence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, delay: Duration::from_millis(1000), timeout: Duration::from_secs(60) }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 { self.max_retries + 1 }

    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> CanvasResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CanvasResult<T>>,
    {
        let mut last_error: Option<String> = None;
        let mut attempt = 0;
        while attempt <= self.max_retries {
            if attempt > 0 {
                warn!("{}: retry {} in {} ms", label, attempt, self.delay.as_millis());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CanvasError::UserAbort),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CanvasError::UserAbort),
                r = tokio::time::timeout(self.timeout, op()) => r,
            };
            match outcome {
                Ok(Ok(v)) => {
                    debug!("{}: ok in {} ms", label, start.elapsed().as_millis());
                    return Ok(v);
                }
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => {
                    warn!("{}: attempt {} failed: {}", label, attempt + 1, e);
                    last_error = Some(match e {
                        CanvasError::TransientNetwork { message, .. } => message,
                        other => other.to_string(),
                    });
                }
                Err(_) => {
                    warn!("{}: attempt {} timed out after {} ms", label, attempt + 1, self.timeout.as_millis());
                    last_error = Some(format!("timed out after {} ms", self.timeout.as_millis()));
                }
            }
            attempt += 1;
        }
        Err(CanvasError::TransientNetwork {
            message: last_error.unwrap_or_else(|| "unknown error".to_string()),
            attempts: attempt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy { max_retries: 3, delay: Duration::from_millis(5), timeout: Duration::from_millis(50) }
    }

    #[tokio::test]
    async fn transient_errors_exhaust_the_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let r: CanvasResult<()> = quick()
            .run("test", &CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(CanvasError::TransientNetwork { message: "down".into(), attempts: 1 })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match r {
            Err(CanvasError::TransientNetwork { attempts, message }) => {
                assert_eq!(attempts, 4);
                assert_eq!(message, "down");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_counts_as_transient_then_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let r = quick()
            .run("test", &CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(7)
                }
            })
            .await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_payload_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let r: CanvasResult<()> = quick()
            .run("test", &CancellationToken::new(), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(CanvasError::invalid_payload("bad shape"))
                }
            })
            .await;
        assert!(matches!(r, Err(CanvasError::InvalidPayload { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts() {
        let token = CancellationToken::new();
        token.cancel();
        let r: CanvasResult<()> = quick().run("test", &token, || async { Ok(()) }).await;
        assert!(matches!(r, Err(CanvasError::UserAbort)));
    }
}
