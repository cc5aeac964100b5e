use std::{
    thread,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::error::{DeviceError, ErrorKind};

const INITIAL_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_millis(500);
const CANCEL_SLICE: Duration = Duration::from_millis(10);

/// Sleep for `dur` unless `cancel` fires first. Returns `true` if cancelled.
pub fn wait_or_cancel(cancel: &CancellationToken, dur: Duration) -> bool {
    let deadline = Instant::now() + dur;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(CANCEL_SLICE.min(deadline - now));
    }
}

/// Run `op` until it succeeds, retrying errors that belong to one of `retry_on`.
///
/// Delays start at 10ms and double up to 500ms, never sleeping past `window`.
/// Non-retryable errors fail immediately as [`DeviceError::Failed`]; cancellation
/// yields [`DeviceError::Cancelled`] and an exhausted window
/// [`DeviceError::DeadlineExceeded`], each wrapping the last observed error.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use hdcap_v4l2::prelude::*;
/// use tokio_util::sync::CancellationToken;
///
/// let cancel = CancellationToken::new();
/// let mut calls = 0;
/// let window = Duration::from_secs(1);
/// let value = retry_with_backoff(&cancel, window, &[ErrorKind::Busy], "VIDIOC_S_FMT", || {
///     calls += 1;
///     if calls < 3 {
///         Err(DeviceError::from_errno("VIDIOC_S_FMT", libc::EBUSY))
///     } else {
///         Ok(calls)
///     }
/// })
/// .unwrap();
/// assert_eq!(value, 3);
/// ```
pub fn retry_with_backoff<T, F>(
    cancel: &CancellationToken,
    window: Duration,
    retry_on: &[ErrorKind],
    op: &'static str,
    mut f: F,
) -> Result<T, DeviceError>
where
    F: FnMut() -> Result<T, DeviceError>,
{
    let deadline = Instant::now() + window;
    let mut delay = INITIAL_DELAY;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let err = match f() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !retry_on.iter().any(|kind| err.is(*kind)) {
            return Err(DeviceError::Failed {
                op,
                attempts,
                source: Box::new(err),
            });
        }
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled {
                op,
                attempts,
                source: Box::new(err),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(DeviceError::DeadlineExceeded {
                op,
                attempts,
                source: Box::new(err),
            });
        }
        tracing::trace!(op, attempts, ?delay, error = %err, "retrying");
        if wait_or_cancel(cancel, delay.min(deadline - now)) {
            return Err(DeviceError::Cancelled {
                op,
                attempts,
                source: Box::new(err),
            });
        }
        delay = next_delay(delay);
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_DELAY)
}
