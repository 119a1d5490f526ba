//! Timers for delays longer than a single sleep should cover, and a fixed-rate repeat loop.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound for a single sleep. Longer delays are chained from several sleeps, each one
/// recomputing the remaining time from the monotonic clock.
pub const MAX_SLEEP_CHUNK: Duration = Duration::from_millis(i32::MAX as u64);

/// Sleep for `duration` in chunks of at most `max_chunk`. Returns `false` if `cancel` fired
/// before the full duration elapsed.
pub async fn sleep_chunked(
    duration: Duration,
    max_chunk: Duration,
    cancel: &CancellationToken,
) -> bool {
    let start = Instant::now();
    loop {
        let remaining = duration.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return true;
        }
        let chunk = remaining.min(max_chunk);
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(chunk) => {}
        }
    }
}

/// A one-shot timer whose delay may exceed [`MAX_SLEEP_CHUNK`].
///
/// This is the public one-shot form of the chunked sleep that [`repeat_until_cancelled`]
/// chains between runs; the monitor loop calls [`sleep_chunked`] directly.
#[derive(Debug)]
pub struct LongTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LongTimer {
    /// Run `callback` once after `duration`. Must be called from within a tokio runtime.
    pub fn schedule<F>(duration: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::schedule_with_chunk(duration, MAX_SLEEP_CHUNK, callback)
    }

    pub fn schedule_with_chunk<F>(duration: Duration, max_chunk: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if sleep_chunked(duration, max_chunk, &token).await {
                callback();
            }
        });
        Self { cancel, handle }
    }

    /// Cancel the pending delay. Has no effect once the callback fired.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LongTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Invoke `callback` every `period` until `cancel` fires. Ticks never overlap: the delay after
/// a tick is `period` minus the time the tick took, clamped at zero. The first tick runs
/// immediately.
pub async fn repeat_until_cancelled<F, Fut>(
    period: Duration,
    cancel: &CancellationToken,
    mut callback: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    while !cancel.is_cancelled() {
        let tick_start = Instant::now();
        callback().await;
        let delay = period.saturating_sub(tick_start.elapsed());
        debug!(
            "Next tick in {}",
            crate::time::humanize_duration(delay)
        );
        if !sleep_chunked(delay, MAX_SLEEP_CHUNK, cancel).await {
            break;
        }
    }
}
