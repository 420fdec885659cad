//! Retry envelope around sync store operations.
//!
//! Transient database faults get up to 3 retries with exponential backoff
//! (100, 200, 400 ms). A non-retryable error short-circuits immediately.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::metrics::StoreMetrics;
use crate::StoreError;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) async fn with_retry<T, F, Fut>(
    metrics: &StoreMetrics,
    operation: &'static str,
    f: F,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    metrics.record_call(operation);
    let started = Instant::now();

    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => {
                metrics.record_duration(operation, started.elapsed().as_secs_f64() * 1000.0);
                return Ok(value);
            }
            Err(error) if error.is_retryable() && attempt < MAX_RETRIES => {
                let backoff = INITIAL_BACKOFF * 2u32.pow(attempt);
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    %error,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) => {
                metrics.record_error(operation);
                return Err(error);
            }
        }
    }
}
