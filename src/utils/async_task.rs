use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::Error;
use crate::Result;
use crate::RetryPolicy;
use crate::SessionError;

/// Runs `task` until it succeeds or `policy.max_retries` attempts have failed.
///
/// Every attempt is bounded by `attempt_timeout`; the attempt number (0-based) is passed
/// to `task`. Exhaustion yields [`SessionError::Connection`] carrying the last failure.
pub(crate) async fn task_with_timeout_and_backoff<F, T, P>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    mut task: F,
) -> Result<P>
where
    F: FnMut(usize) -> T,
    T: Future<Output = Result<P>>,
{
    let mut last_error = String::from("no attempt made");
    for attempt in 0..policy.max_retries {
        match timeout(attempt_timeout, task(attempt)).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) => {
                warn!(attempt, "attempt failed: {}", e);
                last_error = e.to_string();
            }
            Err(_) => {
                warn!(attempt, "attempt timed out after {:?}", attempt_timeout);
                last_error = format!("timed out after {attempt_timeout:?}");
            }
        }

        if attempt + 1 < policy.max_retries {
            sleep(policy.delay_after(attempt)).await;
        }
    }

    warn!("task failed after {} attempts", policy.max_retries);
    Err(Error::Session(SessionError::Connection {
        attempts: policy.max_retries,
        last_error,
    }))
}

/// Spawns a named background task, logging its error instead of dropping it silently
pub(crate) fn spawn_task<Fut>(
    name: &'static str,
    task: Fut,
) -> JoinHandle<()>
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("spawned task: {name} stopped with error: {:?}", e);
        }
    })
}
