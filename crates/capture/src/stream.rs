use std::{thread, time::Instant};

use crossbeam_channel::Receiver;
use hdcap_core::prelude::{FrameBuffer, Pool, PoolError};
use hdcap_v4l2::prelude::{
    DeviceError, ErrorKind, Interest, MappedRegion, PollEvent, VideoDevice, retry_with_backoff,
    spawn_poller,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    device::Shared,
    error::CaptureError,
    handler::{CapturedFrame, FrameMeta},
    stage::Stage,
};

/// Run one stream phase: start the kernel stream, pump frames until the
/// stream scope is cancelled, then stop the kernel stream.
pub(crate) fn run<D: VideoDevice>(
    shared: &Shared,
    device: &D,
    buffers: &[D::Mapping],
) -> Result<(), CaptureError> {
    let guard = shared.begin_stream()?;
    let token = guard.token().clone();
    device.stream_on()?;
    shared.set_stage(Stage::Streaming);
    info!(device = %shared.describe, mode = ?shared.display_mode(), "stream started");

    let result = thread::scope(|scope| -> Result<(), CaptureError> {
        let config = &shared.config;
        let (poller, events) = spawn_poller(
            scope,
            "hdcap-poll",
            config.poll_interval,
            config.poll_depth,
            token.clone(),
            |timeout| device.poll(Interest::CAPTURE, timeout),
        )?;
        let pump = FramePump {
            shared,
            device,
            buffers,
            token: &token,
            last_sequence: None,
        };
        let outcome = match thread::Builder::new()
            .name("hdcap-stream".into())
            .spawn_scoped(scope, move || pump.run(events))
        {
            Ok(worker) => worker.join().unwrap_or(Err(CaptureError::WorkerPanicked)),
            Err(err) => Err(CaptureError::Spawn(err)),
        };
        token.cancel();
        if poller.join().is_err() {
            warn!(device = %shared.describe, "poll worker panicked");
        }
        outcome
    });

    if let Err(err) = device.stream_off() {
        warn!(device = %shared.describe, error = %err, "failed to stop stream");
    }
    info!(device = %shared.describe, "stream stopped");
    drop(guard);
    result
}

struct FramePump<'a, D: VideoDevice> {
    shared: &'a Shared,
    device: &'a D,
    buffers: &'a [D::Mapping],
    token: &'a CancellationToken,
    last_sequence: Option<u32>,
}

impl<D: VideoDevice> FramePump<'_, D> {
    fn run(mut self, events: Receiver<PollEvent>) -> Result<(), CaptureError> {
        for event in events.iter() {
            if self.token.is_cancelled() {
                break;
            }
            let ready = event?;
            // Events first: a pending source change invalidates queued frames.
            let ended = ready.priority && self.handle_event()?;
            if ready.input && !ended {
                self.capture_one()?;
            }
            if ready.error {
                return Err(CaptureError::Hangup);
            }
            if ended {
                break;
            }
        }
        Ok(())
    }

    /// A failed dequeue ends the stream unless it was retryable or the scope is closing.
    fn escalate(&self, err: &DeviceError, retry_on: &[ErrorKind]) -> bool {
        !self.token.is_cancelled() && !retry_on.iter().any(|kind| err.is(*kind))
    }

    /// Returns `true` when the stream must end.
    fn handle_event(&self) -> Result<bool, CaptureError> {
        let window = self.shared.config.event_window;
        let retry_on = [ErrorKind::Temporary, ErrorKind::NoEntity];
        match retry_with_backoff(self.token, window, &retry_on, "VIDIOC_DQEVENT", || {
            self.device.dequeue_event()
        }) {
            Ok(event) if event.is_source_change() => {
                info!(device = %self.shared.describe, ?event, "source changed; renegotiating");
                self.shared.counters.source_changed();
                self.token.cancel();
                Ok(true)
            }
            Ok(event) => {
                debug!(?event, "ignoring device event");
                Ok(false)
            }
            Err(err) if self.escalate(&err, &retry_on) => {
                warn!(device = %self.shared.describe, error = %err, "event dequeue failed");
                Err(err.into())
            }
            Err(err) => {
                debug!(error = %err, "no event dequeued");
                Ok(false)
            }
        }
    }

    fn capture_one(&mut self) -> Result<(), CaptureError> {
        let window = self.shared.config.dequeue_window;
        let retry_on = [ErrorKind::Temporary, ErrorKind::Timeout];
        let dequeued = match retry_with_backoff(self.token, window, &retry_on, "VIDIOC_DQBUF", || {
            self.device.dequeue_buffer()
        }) {
            Ok(dequeued) => dequeued,
            Err(err) if self.escalate(&err, &retry_on) => {
                warn!(device = %self.shared.describe, error = %err, "buffer dequeue failed");
                return Err(err.into());
            }
            Err(err) => {
                if !self.token.is_cancelled() {
                    debug!(error = %err, "dequeue failed; frame dropped");
                    self.shared.counters.dropped();
                }
                return Ok(());
            }
        };
        let requeue = Requeue {
            device: self.device,
            index: dequeued.index,
        };
        self.track_sequence(dequeued.sequence);

        if dequeued.has_error() || dequeued.bytes_used == 0 {
            debug!(
                sequence = dequeued.sequence,
                flags = dequeued.flags,
                "driver flagged frame; dropped"
            );
            self.shared.counters.dropped();
            return Ok(());
        }
        let Some(region) = self.buffers.iter().find(|m| m.index() == dequeued.index) else {
            warn!(index = dequeued.index, "dequeued buffer is not mapped");
            self.shared.counters.dropped();
            return Ok(());
        };
        let Some(payload) = region.as_slice().get(..dequeued.bytes_used as usize) else {
            warn!(
                index = dequeued.index,
                bytes_used = dequeued.bytes_used,
                mapped = region.as_slice().len(),
                "payload larger than the mapped buffer; dropped"
            );
            self.shared.counters.dropped();
            return Ok(());
        };

        let start = Instant::now();
        let copied = copy_frame(&self.shared.pool, payload);
        drop(requeue);
        let buffer = match copied {
            Ok(buffer) => buffer,
            Err(err) => {
                debug!(sequence = dequeued.sequence, error = %err, "frame copy failed; dropped");
                self.shared.counters.dropped();
                return Ok(());
            }
        };
        self.shared.copy_latency.record(start.elapsed());

        let meta = FrameMeta {
            sequence: dequeued.sequence,
            field: dequeued.field,
            timestamp: dequeued.timestamp,
            bytes_used: buffer.len(),
            mode: self.shared.display_mode(),
        };
        self.shared.counters.delivered();
        trace!(sequence = meta.sequence, bytes = meta.bytes_used, "frame delivered");
        if let Err(err) = self.shared.handler.handle(CapturedFrame { buffer, meta }) {
            self.shared.counters.handler_failed();
            warn!(sequence = meta.sequence, error = %err, "frame handler failed");
        }
        Ok(())
    }

    fn track_sequence(&mut self, sequence: u32) {
        if let Some(prev) = self.last_sequence
            && sequence > prev
            && sequence - prev > 1
        {
            let gap = sequence - prev - 1;
            debug!(gap, sequence, "hardware dropped frames");
            self.shared.counters.sequence_gap(gap as u64);
        }
        self.last_sequence = Some(sequence);
    }
}

/// Copy a frame payload into a fresh pool buffer of exactly its size.
fn copy_frame(pool: &Pool, payload: &[u8]) -> Result<FrameBuffer, PoolError> {
    let mut buffer = pool.borrow(payload.len())?;
    match buffer.write(payload) {
        Ok(()) => Ok(buffer),
        Err(err) => {
            if let Err(release) = buffer.release() {
                warn!(error = %release, "failed to release frame buffer");
            }
            Err(err)
        }
    }
}

/// Hands a dequeued kernel buffer back to the driver when dropped.
struct Requeue<'a, D: VideoDevice> {
    device: &'a D,
    index: u32,
}

impl<D: VideoDevice> Drop for Requeue<'_, D> {
    fn drop(&mut self) {
        if let Err(err) = self.device.queue_buffer(self.index) {
            warn!(index = self.index, error = %err, "failed to requeue capture buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_is_sized_to_bytes_used() {
        let pool = Pool::new(8, 1).unwrap();
        let frame = copy_frame(&pool, &[9; 16][..5]).unwrap();
        assert_eq!(frame.len(), 5);
        assert_eq!(frame.capacity(), 5);
        frame.release().unwrap();
    }

    #[test]
    fn copy_larger_than_pool_buffers_fails_without_leaking() {
        let pool = Pool::new(4, 1).unwrap();
        let err = copy_frame(&pool, &[1; 16]).unwrap_err();
        assert_eq!(err.code(), "buffer_size_not_supported");
        assert_eq!(pool.stats().idle, 1);
    }
}
