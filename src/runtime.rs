mod acknowledged_message;
mod join_handle;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::AcknowledgedMessage,
    join_handle::AsyncJoinHandle,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::Result;

/// Spawn a task in the background to run a future.
///
/// This must be called from an async block or function running on a runtime.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Spawn a task in the background to run a future, discarding its handle.
///
/// Note: this must only be called from an async block or function running on a runtime.
pub(crate) fn execute<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    spawn(fut);
}

/// Delay for the specified duration.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| std::io::ErrorKind::TimedOut.into())
}

/// Await on a future, bounding it by `timeout` if one is given.
pub(crate) async fn maybe_timeout<F: Future>(
    timeout: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match timeout {
        Some(duration) => self::timeout(duration, future).await,
        None => Ok(future.await),
    }
}

/// Create a new `Interval` that yields with interval of `duration`.
/// See: <https://docs.rs/tokio/latest/tokio/time/fn.interval.html>
pub(crate) fn interval(duration: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}
