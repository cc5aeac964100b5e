use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use hdcap_core::prelude::{DisplayMode, PixelFormat, Pool, Resolution};
use hdcap_v4l2::prelude::{
    DeviceError, DeviceNode, DvTimings, ErrorKind, EventKind, MappedRegion, PixFormat, VideoDevice,
    require_capture, retry_with_backoff, wait_or_cancel,
};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::CaptureConfig,
    error::CaptureError,
    handler::FrameHandler,
    metrics::{CaptureStats, Counters, StageMetrics},
    stage::{Stage, StageCell},
    stream,
};

type Mappings<M> = SmallVec<[M; 4]>;

/// State shared between the device handle, the supervisor and stream workers.
pub(crate) struct Shared {
    pub(crate) describe: String,
    pub(crate) config: CaptureConfig,
    pub(crate) pool: Pool,
    pub(crate) handler: Arc<dyn FrameHandler>,
    pub(crate) counters: Counters,
    pub(crate) copy_latency: StageMetrics,
    mode: RwLock<Option<DisplayMode>>,
    stage: StageCell,
    stream: Mutex<Option<CancellationToken>>,
    lifetime: CancellationToken,
}

impl Shared {
    pub(crate) fn new(
        describe: String,
        config: CaptureConfig,
        pool: Pool,
        handler: Arc<dyn FrameHandler>,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            describe,
            config,
            pool,
            handler,
            counters: Counters::default(),
            copy_latency: StageMetrics::default(),
            mode: RwLock::new(None),
            stage: StageCell::new(Stage::Idle),
            stream: Mutex::new(None),
            lifetime,
        }
    }

    pub(crate) fn display_mode(&self) -> Option<DisplayMode> {
        *self.mode.read()
    }

    pub(crate) fn set_stage(&self, stage: Stage) {
        self.stage.set(stage);
    }

    fn publish_mode(&self, mode: Option<DisplayMode>) {
        let changed = {
            let mut current = self.mode.write();
            let changed = *current != mode;
            *current = mode;
            changed
        };
        if changed {
            self.handler.on_mode_change(mode);
        }
    }

    /// Open the stream scope; at most one may be active.
    pub(crate) fn begin_stream(&self) -> Result<StreamGuard<'_>, CaptureError> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Err(CaptureError::AlreadyStreaming);
        }
        let token = self.lifetime.child_token();
        *slot = Some(token.clone());
        Ok(StreamGuard { shared: self, token })
    }

    fn stop_stream(&self) -> Result<(), CaptureError> {
        match self.stream.lock().as_ref() {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(CaptureError::NotStreaming),
        }
    }
}

/// Active stream scope; clears the slot when dropped.
pub(crate) struct StreamGuard<'a> {
    shared: &'a Shared,
    token: CancellationToken,
}

impl StreamGuard<'_> {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.shared.stream.lock().take();
    }
}

/// One physical capture device driven by a self-healing control loop.
///
/// [`CaptureDevice::open`] verifies the device once, then a supervisor
/// thread cycles through open, timings, format, memory and streaming until
/// the lifetime scope is cancelled. Failures after construction are logged
/// and retried from the top; they never surface to the caller.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use hdcap_capture::prelude::*;
/// use tokio_util::sync::CancellationToken;
///
/// let pool = Pool::new(1920 * 1080 * 3, 6)?;
/// let source = Arc::new(DisplaySource::new(PixelFormat::Rgb24));
/// let device = CaptureDevice::open(
///     V4l2Node::new("/dev/video0"),
///     CaptureConfig::new("/dev/video0"),
///     pool,
///     source.clone(),
///     &CancellationToken::new(),
/// )?;
/// println!("mode: {:?}", device.display_mode());
/// device.shutdown();
/// # Ok::<(), CaptureError>(())
/// ```
pub struct CaptureDevice {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureDevice {
    /// Verify the device and start its control loop.
    ///
    /// The device's lifetime scope is a child of `parent`: cancelling
    /// `parent` stops the device, dropping the device does not cancel `parent`.
    pub fn open<N: DeviceNode>(
        node: N,
        config: CaptureConfig,
        pool: Pool,
        handler: Arc<dyn FrameHandler>,
        parent: &CancellationToken,
    ) -> Result<Self, CaptureError> {
        config.validate()?;
        let config = config.sanitized();
        let describe = node.describe();
        {
            let device = node.open()?;
            require_capture(&device.capabilities()?)?;
        }
        let shared = Arc::new(Shared::new(describe, config, pool, handler, parent.child_token()));
        let supervisor = Supervisor {
            node,
            shared: shared.clone(),
        };
        let worker = thread::Builder::new()
            .name("hdcap-capture".into())
            .spawn(move || supervisor.run())?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Location of the device, for logs.
    pub fn describe(&self) -> &str {
        &self.shared.describe
    }

    /// Negotiated mode; `None` until a format has been committed.
    pub fn display_mode(&self) -> Option<DisplayMode> {
        self.shared.display_mode()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.shared.config.pixel_format
    }

    pub fn stage(&self) -> Stage {
        self.shared.stage.get()
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.counters.snapshot()
    }

    /// Time spent copying each frame out of kernel memory.
    pub fn copy_latency(&self) -> StageMetrics {
        self.shared.copy_latency.clone()
    }

    pub fn pool(&self) -> &Pool {
        &self.shared.pool
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.stream.lock().is_some()
    }

    /// End the current stream phase, forcing a full re-negotiation.
    pub fn stop_stream(&self) -> Result<(), CaptureError> {
        self.shared.stop_stream()
    }

    /// Token of the device lifetime scope.
    pub fn lifetime(&self) -> CancellationToken {
        self.shared.lifetime.clone()
    }

    /// Cancel the lifetime scope and wait for the control loop to unwind.
    pub fn shutdown(mut self) {
        self.teardown_in_place();
    }

    fn teardown_in_place(&mut self) {
        self.shared.lifetime.cancel();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!(device = %self.shared.describe, "capture supervisor panicked");
        }
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.teardown_in_place();
    }
}

struct Supervisor<N: DeviceNode> {
    node: N,
    shared: Arc<Shared>,
}

impl<N: DeviceNode> Supervisor<N> {
    fn run(self) {
        let shared = &self.shared;
        info!(device = %shared.describe, "capture supervisor started");
        while !shared.lifetime.is_cancelled() {
            shared.set_stage(Stage::Idle);
            let Err(err) = self.cycle() else {
                continue;
            };
            if shared.lifetime.is_cancelled() {
                break;
            }
            warn!(
                device = %shared.describe,
                stage = %shared.stage.get(),
                error = %err,
                "capture cycle failed; restarting"
            );
            shared.counters.restarted();
            if wait_or_cancel(&shared.lifetime, shared.config.restart_delay) {
                break;
            }
        }
        shared.publish_mode(None);
        shared.set_stage(Stage::Closed);
        info!(device = %shared.describe, "capture supervisor stopped");
    }

    fn cycle(&self) -> Result<(), CaptureError> {
        let device = self.open()?;
        let timings = self.acquire_timings(&device)?;
        self.negotiate_format(&device, &timings)?;
        let buffers = self.init_memory(&device)?;
        let streamed = stream::run(&self.shared, &device, &buffers);
        let released = self.release_memory(&device, buffers);
        streamed?;
        released?;
        self.close(device);
        Ok(())
    }

    fn open(&self) -> Result<N::Device, CaptureError> {
        let device = self.node.open()?;
        require_capture(&device.capabilities()?)?;
        device.subscribe_event(EventKind::SourceChange)?;
        self.shared.set_stage(Stage::Opened);
        Ok(device)
    }

    fn acquire_timings(&self, device: &N::Device) -> Result<DvTimings, CaptureError> {
        let shared = &self.shared;
        shared.publish_mode(None);
        let window = shared.config.timings_window;
        let retry_on = [ErrorKind::Busy, ErrorKind::NoLink];
        let timings = retry_with_backoff(
            &shared.lifetime,
            window,
            &retry_on,
            "VIDIOC_QUERY_DV_TIMINGS",
            || device.query_dv_timings(),
        )?;
        if !timings.is_bt656_1120() {
            return Err(DeviceError::UnsupportedTimings(timings.kind).into());
        }
        let timings = retry_with_backoff(
            &shared.lifetime,
            window,
            &retry_on,
            "VIDIOC_S_DV_TIMINGS",
            || device.set_dv_timings(&timings),
        )?;
        info!(
            device = %shared.describe,
            width = timings.width,
            height = timings.height,
            fps = timings.frame_rate(),
            "signal timings acquired"
        );
        shared.set_stage(Stage::TimingsAcquired);
        Ok(timings)
    }

    fn negotiate_format(
        &self,
        device: &N::Device,
        timings: &DvTimings,
    ) -> Result<PixFormat, CaptureError> {
        let shared = &self.shared;
        let fourcc = shared.config.pixel_format.fourcc();
        device.find_format(fourcc)?;

        let request = PixFormat::new(timings.width, timings.height, fourcc);
        let tried = device.try_format(&request)?;
        if (tried.width, tried.height) != (request.width, request.height) {
            debug!(
                requested = %format_args!("{}x{}", request.width, request.height),
                adjusted = %format_args!("{}x{}", tried.width, tried.height),
                "driver adjusted format"
            );
        }
        retry_with_backoff(
            &shared.lifetime,
            shared.config.busy_window,
            &[ErrorKind::Busy],
            "VIDIOC_S_FMT",
            || device.set_format(&tried),
        )?;
        let actual = device.format()?;
        if actual.fourcc != fourcc {
            return Err(DeviceError::UnsupportedFormat(actual.fourcc).into());
        }
        let resolution =
            Resolution::new(actual.width, actual.height).ok_or(CaptureError::InvalidGeometry {
                width: actual.width,
                height: actual.height,
            })?;
        let mode = DisplayMode::new(resolution, timings.frame_rate());
        if actual.size_image as usize > shared.pool.buffer_capacity() {
            warn!(
                frame_bytes = actual.size_image,
                pool_bytes = shared.pool.buffer_capacity(),
                "pool buffers are smaller than a frame; frames will be dropped"
            );
        }
        shared.set_stage(Stage::FormatNegotiated);
        shared.publish_mode(Some(mode));
        info!(device = %shared.describe, %mode, format = %actual.fourcc, "format negotiated");
        Ok(actual)
    }

    fn init_memory(
        &self,
        device: &N::Device,
    ) -> Result<Mappings<<N::Device as VideoDevice>::Mapping>, CaptureError> {
        let granted = device.request_buffers(self.shared.config.kernel_buffers)?;
        let mut mapped = Mappings::new();
        for index in 0..granted {
            if let Err(err) = bind(device, index, &mut mapped) {
                debug!(index, bound = mapped.len(), "rolling back buffer binding");
                if let Err(unmap) = unbind_all(mapped) {
                    warn!(error = %unmap, "rollback unmap failed");
                }
                return Err(err.into());
            }
        }
        debug!(granted, "kernel buffers mapped and queued");
        self.shared.set_stage(Stage::MemoryInitialized);
        Ok(mapped)
    }

    fn release_memory(
        &self,
        device: &N::Device,
        buffers: Mappings<<N::Device as VideoDevice>::Mapping>,
    ) -> Result<(), CaptureError> {
        unbind_all(buffers)?;
        // Runs during shutdown too, so it does not observe the lifetime scope.
        let unwind = CancellationToken::new();
        retry_with_backoff(
            &unwind,
            self.shared.config.busy_window,
            &[ErrorKind::Busy],
            "VIDIOC_REQBUFS",
            || device.request_buffers(0),
        )?;
        self.shared.set_stage(Stage::MemoryReleased);
        Ok(())
    }

    fn close(&self, device: N::Device) {
        if let Err(err) = device.unsubscribe_event(EventKind::SourceChange) {
            debug!(error = %err, "event unsubscribe failed");
        }
        drop(device);
        self.shared.set_stage(Stage::Closed);
    }
}

/// Query, map and queue one kernel buffer. A mapped buffer is pushed before
/// queueing so a queue failure still unmaps it.
fn bind<D: VideoDevice>(
    device: &D,
    index: u32,
    mapped: &mut Mappings<D::Mapping>,
) -> Result<(), DeviceError> {
    let info = device.query_buffer(index)?;
    mapped.push(device.map_buffer(&info)?);
    device.queue_buffer(index)
}

fn unbind_all<M: MappedRegion>(buffers: Mappings<M>) -> Result<(), DeviceError> {
    let mut first = None;
    for buffer in buffers {
        let index = buffer.index();
        if let Err(err) = buffer.unmap() {
            warn!(index, error = %err, "failed to unmap capture buffer");
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use hdcap_core::prelude::{FourCc, FrameBuffer};
    use hdcap_v4l2::prelude::Capabilities;

    use super::*;
    use crate::{
        handler::{CapturedFrame, HandlerError},
        sim::{SimMapping, SimNode, SimStep, cea_1080p60},
        source::DisplaySource,
    };

    const FRAME: SimStep = SimStep::Frame { bytes_used: 1024 };

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn config() -> CaptureConfig {
        CaptureConfig::new("sim").with_restart_delay(Duration::from_millis(10))
    }

    type Seen = Arc<parking_lot::Mutex<Vec<(usize, u8, u32)>>>;

    fn collector() -> (Seen, Arc<dyn FrameHandler>) {
        let seen: Seen = Default::default();
        let sink = seen.clone();
        let handler = move |frame: CapturedFrame| -> Result<(), HandlerError> {
            let data = frame.buffer.to_vec();
            sink.lock().push((data.len(), data[0], frame.meta.sequence));
            frame.buffer.release()?;
            Ok(())
        };
        (seen, Arc::new(handler))
    }

    fn open(node: &SimNode, pool: &Pool, handler: Arc<dyn FrameHandler>) -> CaptureDevice {
        let lifetime = CancellationToken::new();
        CaptureDevice::open(node.clone(), config(), pool.clone(), handler, &lifetime).unwrap()
    }

    #[test]
    fn source_change_ends_stream_after_delivered_frames() {
        let node = SimNode::new().push_phase([FRAME, FRAME, FRAME, SimStep::SourceChange]);
        let pool = Pool::new(4096, 4).unwrap();
        let (seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| node.calls().stream_ons >= 2));
        thread::sleep(Duration::from_millis(50));

        let calls = node.calls();
        assert!(calls.timings_queries >= 2);
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(len, _, _)| *len == 1024));
        assert_eq!(
            seen.iter().map(|(_, byte, _)| *byte).collect::<Vec<_>>(),
            vec![SimMapping::fill(0), SimMapping::fill(1), SimMapping::fill(2)]
        );
        assert_eq!(seen.iter().map(|(_, _, seq)| *seq).collect::<Vec<_>>(), vec![0, 1, 2]);

        let stats = device.stats();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.source_changes, 1);
        assert_eq!(stats.restarts, 0);
        device.shutdown();
        assert_eq!(pool.stats().idle, 4);
    }

    #[test]
    fn committed_format_follows_driver_adjustment() {
        let node = SimNode::new().with_adjusted_height(1088);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.display_mode().is_some()));
        let mode = device.display_mode().unwrap();
        assert_eq!(mode.resolution, Resolution::new(1920, 1088).unwrap());
        assert_eq!(mode.refresh_hz, 60);
        let committed = node.format().unwrap();
        assert_eq!((committed.width, committed.height), (1920, 1088));
        assert_eq!(committed.fourcc, FourCc::new(*b"RGB3"));
        device.shutdown();
    }

    #[test]
    fn failed_bind_unmaps_exactly_the_bound_buffers() {
        let node = SimNode::new().fail_query_buffer_at(2);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| node.calls().stream_ons >= 1));
        assert_eq!(node.unmapped(), vec![0, 1]);
        assert_eq!(node.mapped().len(), 4);
        assert!(device.stats().restarts >= 1);

        device.shutdown();
        assert!(node.mapped().is_empty());
        assert_eq!(node.calls().request_buffers.last(), Some(&0));
    }

    #[test]
    fn timings_retry_while_link_is_down() {
        let node = SimNode::new().with_timings_errors([libc::ENOLCK, libc::EBUSY, libc::ENOLINK]);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| node.calls().stream_ons >= 1));
        assert_eq!(node.calls().timings_queries, 4);
        assert_eq!(device.stats().restarts, 0);
        device.shutdown();
    }

    #[test]
    fn missing_pixel_format_restarts_without_streaming() {
        let node = SimNode::new().with_formats([FourCc::new(*b"YUYV")]);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().restarts >= 2));
        let calls = node.calls();
        assert_eq!(calls.try_formats, 0);
        assert_eq!(calls.stream_ons, 0);
        assert_eq!(device.display_mode(), None);
        device.shutdown();
    }

    #[test]
    fn open_rejects_device_without_streaming() {
        let mut caps = Capabilities::capture_and_streaming("capture only");
        caps.flags = hdcap_v4l2::bindings::V4L2_CAP_VIDEO_CAPTURE;
        let node = SimNode::new().with_capabilities(caps);
        let (_seen, handler) = collector();
        let pool = Pool::new(16, 1).unwrap();
        let err = CaptureDevice::open(node, config(), pool, handler, &CancellationToken::new())
            .err()
            .unwrap();
        assert_eq!(err.code(), "unsupported_streaming");
    }

    #[test]
    fn flagged_and_lost_frames_are_counted() {
        let node = SimNode::new().push_phase([
            SimStep::ErrorFrame { bytes_used: 512 },
            SimStep::Lost,
            FRAME,
        ]);
        let pool = Pool::new(4096, 2).unwrap();
        let (seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().delivered == 1));
        let stats = device.stats();
        assert!(stats.dropped >= 1);
        assert_eq!(stats.sequence_gaps, 1);
        assert_eq!(seen.lock()[0].2, 2);
        device.shutdown();
    }

    #[test]
    fn undersized_pool_drops_frames_and_keeps_streaming() {
        let node = SimNode::new().push_phase([FRAME, FRAME]);
        let pool = Pool::new(512, 2).unwrap();
        let (seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().dropped >= 2));
        assert!(seen.lock().is_empty());
        assert_eq!(device.stage(), Stage::Streaming);
        assert_eq!(pool.stats().idle, 2);
        device.shutdown();
    }

    #[test]
    fn external_stop_forces_renegotiation() {
        let node = SimNode::new();
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.is_streaming()));
        device.stop_stream().unwrap();
        assert!(wait_until(|| node.calls().stream_ons >= 2));
        assert!(node.calls().timings_queries >= 2);
        device.shutdown();
        assert!(!node.is_streaming());
    }

    #[test]
    fn second_stream_scope_is_rejected() {
        let (_seen, handler) = collector();
        let shared = Shared::new(
            "test".into(),
            config(),
            Pool::new(16, 1).unwrap(),
            handler,
            CancellationToken::new(),
        );
        assert!(matches!(shared.stop_stream(), Err(CaptureError::NotStreaming)));
        let guard = shared.begin_stream().unwrap();
        assert!(matches!(shared.begin_stream(), Err(CaptureError::AlreadyStreaming)));
        shared.stop_stream().unwrap();
        assert!(guard.token().is_cancelled());
        drop(guard);
        assert!(shared.begin_stream().is_ok());
    }

    #[test]
    fn lifetime_cancel_ends_stream_scope() {
        let (_seen, handler) = collector();
        let lifetime = CancellationToken::new();
        let pool = Pool::new(16, 1).unwrap();
        let shared = Shared::new("test".into(), config(), pool, handler, lifetime.clone());
        let guard = shared.begin_stream().unwrap();
        lifetime.cancel();
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn display_source_sees_mode_and_frames() {
        let node = SimNode::new().push_phase([FRAME]);
        let pool = Pool::new(4096, 3).unwrap();
        let source = Arc::new(DisplaySource::new(PixelFormat::Rgb24));
        let device = open(&node, &pool, source.clone());

        assert!(wait_until(|| source.display_frame_buffer().is_ok()));
        let frame: FrameBuffer = source.display_frame_buffer().unwrap();
        assert_eq!(frame.len(), 1024);
        let mode = source.display_mode().unwrap();
        assert_eq!(mode.to_string(), "1920x1080@60");
        frame.release().unwrap();

        device.shutdown();
        assert_eq!(source.display_mode(), None);
        assert!(source.display_frame_buffer().is_err());
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn hard_dequeue_fault_restarts_the_cycle() {
        let node = SimNode::new().push_phase([SimStep::DequeueError { errno: libc::EIO }]);
        let pool = Pool::new(4096, 2).unwrap();
        let (seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().restarts >= 1 && node.calls().stream_ons >= 2));
        let stats = device.stats();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.delivered, 0);
        assert!(seen.lock().is_empty());
        assert!(node.calls().timings_queries >= 2);
        device.shutdown();
        assert!(node.mapped().is_empty());
    }

    #[test]
    fn hangup_alone_restarts_the_cycle() {
        let node = SimNode::new().push_phase([SimStep::Hangup]);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().restarts >= 1 && node.calls().stream_ons >= 2));
        let calls = node.calls();
        assert_eq!(calls.stream_offs, calls.stream_ons - 1);
        device.shutdown();
    }

    #[test]
    fn hangup_with_ready_frame_delivers_then_restarts() {
        let node = SimNode::new().push_phase([SimStep::Hangup, FRAME, FRAME]);
        let pool = Pool::new(4096, 2).unwrap();
        let (seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().restarts >= 1 && node.calls().stream_ons >= 2));
        // The frame reported together with the error is still captured; the rest
        // of the phase is not.
        assert_eq!(device.stats().delivered, 1);
        assert_eq!(seen.lock().len(), 1);
        device.shutdown();
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn hangup_with_pending_event_restarts() {
        let node = SimNode::new().push_phase([SimStep::Hangup, SimStep::SourceChange]);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().restarts >= 1 && node.calls().stream_ons >= 2));
        assert_eq!(device.stats().source_changes, 1);
        device.shutdown();
    }

    #[test]
    fn partial_grant_streams_with_granted_buffers() {
        let node = SimNode::new().with_max_grant(2).push_phase([FRAME, FRAME, FRAME]);
        let pool = Pool::new(4096, 2).unwrap();
        let (seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().delivered == 3));
        assert_eq!(node.calls().request_buffers[0], 4);
        let mut mapped = node.mapped();
        mapped.sort();
        assert_eq!(mapped, vec![0, 1]);
        // Buffers are requeued and reused round-robin.
        let fills: Vec<u8> = seen.lock().iter().map(|(_, byte, _)| *byte).collect();
        assert_eq!(fills, vec![SimMapping::fill(0), SimMapping::fill(1), SimMapping::fill(0)]);
        device.shutdown();
        assert_eq!(node.calls().request_buffers.last(), Some(&0));
    }

    #[test]
    fn zero_grant_restarts_without_streaming() {
        let node = SimNode::new().with_max_grant(0);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().restarts >= 2));
        let calls = node.calls();
        assert_eq!(calls.stream_ons, 0);
        assert_eq!(calls.buffer_queries, 0);
        assert!(calls.request_buffers.iter().all(|count| *count == 4));
        assert!(node.mapped().is_empty());
        device.shutdown();
    }

    #[test]
    fn payload_beyond_mapping_is_dropped() {
        let node = SimNode::new()
            .with_buffer_len(1024)
            .push_phase([SimStep::Frame { bytes_used: 2048 }, SimStep::Frame { bytes_used: 512 }]);
        let pool = Pool::new(4096, 2).unwrap();
        let (seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().delivered == 1));
        assert_eq!(device.stats().dropped, 1);
        assert_eq!(seen.lock()[0].0, 512);
        assert_eq!(device.stage(), Stage::Streaming);
        device.shutdown();
    }

    #[test]
    fn non_bt656_timings_restart_before_format() {
        let node = SimNode::new().with_timings(DvTimings {
            kind: 1,
            ..cea_1080p60()
        });
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.stats().restarts >= 2));
        let calls = node.calls();
        assert_eq!(calls.timings_sets, 0);
        assert_eq!(calls.try_formats, 0);
        assert_eq!(device.display_mode(), None);
        device.shutdown();
    }

    #[test]
    fn detected_timings_set_the_published_mode() {
        let node = SimNode::new().with_timings(DvTimings {
            width: 1280,
            height: 720,
            h_front_porch: 110,
            h_sync: 40,
            h_back_porch: 220,
            v_front_porch: 5,
            v_sync: 5,
            v_back_porch: 20,
            pixel_clock: 74_250_000,
            cea861_vic: 4,
            ..cea_1080p60()
        });
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| device.display_mode().is_some()));
        assert_eq!(device.display_mode().unwrap().to_string(), "1280x720@60");
        let committed = node.format().unwrap();
        assert_eq!((committed.width, committed.height), (1280, 720));
        device.shutdown();
    }

    #[test]
    fn busy_format_commit_is_retried() {
        let node = SimNode::new().with_set_format_errors([libc::EBUSY, libc::EBUSY]);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| node.calls().stream_ons >= 1));
        assert_eq!(node.calls().set_formats, 3);
        assert_eq!(device.stats().restarts, 0);
        device.shutdown();
    }

    #[test]
    fn failed_buffer_release_counts_a_restart() {
        let node = SimNode::new()
            .with_release_errors([libc::EIO])
            .push_phase([FRAME, SimStep::SourceChange]);
        let pool = Pool::new(4096, 2).unwrap();
        let (_seen, handler) = collector();
        let device = open(&node, &pool, handler);

        assert!(wait_until(|| node.calls().stream_ons >= 2));
        let stats = device.stats();
        assert_eq!(stats.source_changes, 1);
        assert_eq!(stats.restarts, 1);
        // Buffers were unmapped before the release call failed.
        assert_eq!(node.unmapped().len(), 4);
        device.shutdown();
    }
}
