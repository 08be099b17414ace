//! Bounded readiness polling
//!
//! Establishment and the send-queue drain both wait for a condition that is
//! only observable by asking (`connection_state`, `ready_state`). The future
//! returned here checks the predicate on a fixed interval and gives up after a
//! deadline; dropping it cancels the wait.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Wait until `predicate` returns true, checking every `interval`
///
/// The predicate is evaluated once immediately. Fails with
/// [`Error::Timeout`] naming `what` when `timeout` elapses first.
pub async fn wait_until<F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(format!(
                "{} not reached within {:?}",
                what, timeout
            )));
        }
        sleep(interval.min(deadline - now)).await;
    }
}
