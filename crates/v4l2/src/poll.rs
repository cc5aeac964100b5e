use std::{
    io,
    thread::{self, Scope, ScopedJoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use tokio_util::sync::CancellationToken;

use crate::{error::DeviceError, io::Readiness};

/// One notification from the poll producer.
pub type PollEvent = Result<Readiness, DeviceError>;

/// Spawn a named scoped thread that turns bounded waits into a readiness stream.
///
/// `wait` is called with `interval` until `cancel` fires, an error is returned,
/// or the descriptor reports an error condition. Empty wakeups are not
/// forwarded. The producer's sender is dropped on exit, so the receiver sees
/// end-of-stream exactly once.
pub fn spawn_poller<'scope, 'env, F>(
    scope: &'scope Scope<'scope, 'env>,
    name: &str,
    interval: Duration,
    depth: usize,
    cancel: CancellationToken,
    mut wait: F,
) -> io::Result<(ScopedJoinHandle<'scope, ()>, Receiver<PollEvent>)>
where
    F: FnMut(Duration) -> PollEvent + Send + 'scope,
{
    let (tx, rx) = bounded(depth.max(1));
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn_scoped(scope, move || {
            while !cancel.is_cancelled() {
                let event = wait(interval);
                let last = match &event {
                    Ok(ready) if ready.is_empty() => continue,
                    Ok(ready) => ready.error,
                    Err(_) => true,
                };
                if !forward(&tx, &cancel, interval, event) || last {
                    break;
                }
            }
            tracing::trace!("poller exiting");
        })?;
    Ok((handle, rx))
}

fn forward(
    tx: &Sender<PollEvent>,
    cancel: &CancellationToken,
    interval: Duration,
    mut event: PollEvent,
) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match tx.send_timeout(event, interval) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => event = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn input() -> Readiness {
        Readiness {
            input: true,
            ..Default::default()
        }
    }

    #[test]
    fn stream_ends_once_after_cancel() {
        let cancel = CancellationToken::new();
        thread::scope(|scope| {
            let interval = Duration::from_millis(5);
            let (handle, rx) = spawn_poller(scope, "test-poll", interval, 2, cancel.clone(), |d| {
                thread::sleep(d);
                Ok(input())
            })
            .unwrap();
            assert!(rx.recv().unwrap().unwrap().input);
            let start = Instant::now();
            cancel.cancel();
            while rx.recv().is_ok() {}
            assert!(start.elapsed() < Duration::from_secs(1));
            assert!(rx.recv().is_err());
            handle.join().unwrap();
        });
    }

    #[test]
    fn empty_wakeups_are_not_forwarded() {
        let cancel = CancellationToken::new();
        let mut n = 0;
        thread::scope(|scope| {
            let interval = Duration::from_millis(1);
            let wait = move |_: Duration| {
                n += 1;
                if n < 5 {
                    Ok(Readiness::default())
                } else {
                    Err(DeviceError::from_errno("poll", libc::EBADF))
                }
            };
            let (_handle, rx) =
                spawn_poller(scope, "test-poll", interval, 4, cancel.clone(), wait).unwrap();
            assert!(rx.recv().unwrap().is_err());
            assert!(rx.recv().is_err());
        });
    }

    #[test]
    fn error_condition_is_last_item() {
        let cancel = CancellationToken::new();
        thread::scope(|scope| {
            let interval = Duration::from_millis(1);
            let (_handle, rx) = spawn_poller(scope, "test-poll", interval, 4, cancel.clone(), |_| {
                Ok(Readiness {
                    error: true,
                    ..Default::default()
                })
            })
            .unwrap();
            assert!(rx.recv().unwrap().unwrap().error);
            assert!(rx.recv().is_err());
        });
    }
}
