use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `check` until it returns `true` or the timeout elapses.
///
/// Returns the final result of the check.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        sleep(POLL_INTERVAL).await;
    }
}

/// Polls the async `check` until it returns `true` or the timeout elapses.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        sleep(POLL_INTERVAL).await;
    }
}
