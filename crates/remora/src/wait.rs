//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};

use crate::error::Result;

/// Poll `predicate` every `interval` until it holds or `budget` runs out.
///
/// Returns `true` as soon as the predicate is satisfied, `false` once the
/// budget is spent. The predicate is checked one final time at the deadline.
/// Never fails.
pub async fn wait_for_condition<F>(mut predicate: F, interval: Duration, budget: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + budget;
    loop {
        if predicate() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Like [`wait_for_condition`] for an async predicate that can fail.
///
/// The first error ends the wait and is returned. Running out of budget is
/// `Ok(false)`, including when a single poll is still pending at the
/// deadline; that poll is dropped.
pub async fn try_wait_for<F, Fut>(mut predicate: F, interval: Duration, budget: Duration) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + budget;
    loop {
        match timeout_at(deadline, predicate()).await {
            Ok(satisfied) => {
                if satisfied? {
                    return Ok(true);
                }
            }
            Err(_) => return Ok(false),
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        sleep(interval.min(deadline - now)).await;
    }
}
