//! Scripted in-memory capture device.
//!
//! Each stream phase (one `stream_on` .. `stream_off`) consumes the next
//! scripted list of [`SimStep`]s. Every call the control loop makes is
//! recorded in [`SimCalls`].

use std::{collections::VecDeque, sync::Arc, thread, time::Duration};

use hdcap_core::prelude::FourCc;
use hdcap_v4l2::{
    bindings,
    prelude::{
        BufferInfo, Capabilities, DequeuedBuffer, DeviceError, DeviceNode, DvTimings, Event,
        EventKind, Field, FormatDesc, Interest, MappedRegion, PixFormat, Readiness, VideoDevice,
    },
};
use parking_lot::Mutex;

/// One scripted happening during a stream phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStep {
    /// A filled buffer carrying `bytes_used` bytes.
    Frame { bytes_used: u32 },
    /// A buffer the driver flags as corrupted.
    ErrorFrame { bytes_used: u32 },
    /// A frame the hardware dropped; only the sequence number advances.
    Lost,
    /// Input signal changed.
    SourceChange,
    /// Poll reports input, but every dequeue fails with `errno` until the phase ends.
    DequeueError { errno: i32 },
    /// The next poll also reports an error condition, on top of whatever is ready.
    Hangup,
}

/// Counters of calls made against the simulated device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCalls {
    pub opens: u32,
    pub subscribes: u32,
    pub timings_queries: u32,
    pub timings_sets: u32,
    pub try_formats: u32,
    pub set_formats: u32,
    pub request_buffers: Vec<u32>,
    pub buffer_queries: u32,
    pub stream_ons: u32,
    pub stream_offs: u32,
    pub dequeues: u32,
}

struct SimState {
    caps: Capabilities,
    formats: Vec<FourCc>,
    timings: DvTimings,
    timings_errors: VecDeque<i32>,
    set_format_errors: VecDeque<i32>,
    release_errors: VecDeque<i32>,
    adjusted_height: Option<u32>,
    fail_query_at: Option<u32>,
    max_grant: u32,
    buffer_len: u32,
    phases: VecDeque<Vec<SimStep>>,
    pending: VecDeque<SimStep>,
    events: VecDeque<Event>,
    input_reported: bool,
    streaming: bool,
    granted: u32,
    queued: VecDeque<u32>,
    mapped: Vec<u32>,
    unmapped: Vec<u32>,
    format: Option<PixFormat>,
    sequence: u32,
    calls: SimCalls,
}

/// CEA-861 1920x1080 at 60Hz.
pub fn cea_1080p60() -> DvTimings {
    DvTimings {
        kind: bindings::V4L2_DV_BT_656_1120,
        width: 1920,
        height: 1080,
        h_front_porch: 88,
        h_sync: 44,
        h_back_porch: 148,
        v_front_porch: 4,
        v_sync: 5,
        v_back_porch: 36,
        pixel_clock: 148_500_000,
        cea861_vic: 16,
        ..Default::default()
    }
}

/// Handle to a simulated device; clones share state.
#[derive(Clone)]
pub struct SimNode {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimNode {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNode {
    /// A 1080p60 RGB3 bridge granting up to four 4KiB buffers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                caps: Capabilities::capture_and_streaming("sim hdmi bridge"),
                formats: vec![FourCc::new(*b"RGB3")],
                timings: cea_1080p60(),
                timings_errors: VecDeque::new(),
                set_format_errors: VecDeque::new(),
                release_errors: VecDeque::new(),
                adjusted_height: None,
                fail_query_at: None,
                max_grant: 4,
                buffer_len: 4096,
                phases: VecDeque::new(),
                pending: VecDeque::new(),
                events: VecDeque::new(),
                input_reported: false,
                streaming: false,
                granted: 0,
                queued: VecDeque::new(),
                mapped: Vec::new(),
                unmapped: Vec::new(),
                format: None,
                sequence: 0,
                calls: SimCalls::default(),
            })),
        }
    }

    pub fn with_capabilities(self, caps: Capabilities) -> Self {
        self.state.lock().caps = caps;
        self
    }

    pub fn with_formats(self, formats: impl IntoIterator<Item = FourCc>) -> Self {
        self.state.lock().formats = formats.into_iter().collect();
        self
    }

    pub fn with_timings(self, timings: DvTimings) -> Self {
        self.state.lock().timings = timings;
        self
    }

    /// Errno values returned by the next timings queries, in order.
    pub fn with_timings_errors(self, errnos: impl IntoIterator<Item = i32>) -> Self {
        self.state.lock().timings_errors.extend(errnos);
        self
    }

    /// Errno values returned by the next format commits, in order.
    pub fn with_set_format_errors(self, errnos: impl IntoIterator<Item = i32>) -> Self {
        self.state.lock().set_format_errors.extend(errnos);
        self
    }

    /// Errno values returned by the next buffer releases (`request_buffers(0)`), in order.
    pub fn with_release_errors(self, errnos: impl IntoIterator<Item = i32>) -> Self {
        self.state.lock().release_errors.extend(errnos);
        self
    }

    /// The driver rounds every requested height to `height`.
    pub fn with_adjusted_height(self, height: u32) -> Self {
        self.state.lock().adjusted_height = Some(height);
        self
    }

    /// The next query of buffer `index` fails with `EINVAL`.
    pub fn fail_query_buffer_at(self, index: u32) -> Self {
        self.state.lock().fail_query_at = Some(index);
        self
    }

    /// Upper bound on granted kernel buffers; zero grants none.
    pub fn with_max_grant(self, count: u32) -> Self {
        self.state.lock().max_grant = count;
        self
    }

    /// Length of every kernel buffer mapping.
    pub fn with_buffer_len(self, len: u32) -> Self {
        self.state.lock().buffer_len = len;
        self
    }

    /// Script the next stream phase.
    pub fn push_phase(self, steps: impl IntoIterator<Item = SimStep>) -> Self {
        self.state.lock().phases.push_back(steps.into_iter().collect());
        self
    }

    pub fn calls(&self) -> SimCalls {
        self.state.lock().calls.clone()
    }

    /// Indices unmapped so far, in order.
    pub fn unmapped(&self) -> Vec<u32> {
        self.state.lock().unmapped.clone()
    }

    /// Indices currently mapped.
    pub fn mapped(&self) -> Vec<u32> {
        self.state.lock().mapped.clone()
    }

    /// Last committed format.
    pub fn format(&self) -> Option<PixFormat> {
        self.state.lock().format
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }
}

impl DeviceNode for SimNode {
    type Device = SimDevice;

    fn open(&self) -> Result<SimDevice, DeviceError> {
        self.state.lock().calls.opens += 1;
        Ok(SimDevice {
            state: self.state.clone(),
        })
    }

    fn describe(&self) -> String {
        "sim".to_string()
    }
}

/// Open simulated device.
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

// Linux errno values; the simulation does not link libc directly.
const EINVAL: i32 = 22;
const EBUSY: i32 = 16;
const EAGAIN: i32 = 11;
const ENOENT: i32 = 2;

impl SimState {
    /// Hardware drops advance the sequence counter without producing a buffer.
    fn skip_lost(&mut self) {
        while self.pending.front() == Some(&SimStep::Lost) {
            self.pending.pop_front();
            self.sequence += 1;
        }
    }

    fn adjust(&self, request: &PixFormat) -> PixFormat {
        PixFormat {
            height: self.adjusted_height.unwrap_or(request.height),
            field: Field::Progressive,
            size_image: self.buffer_len,
            ..*request
        }
    }
}

impl VideoDevice for SimDevice {
    type Mapping = SimMapping;

    fn capabilities(&self) -> Result<Capabilities, DeviceError> {
        Ok(self.state.lock().caps.clone())
    }

    fn subscribe_event(&self, _kind: EventKind) -> Result<(), DeviceError> {
        self.state.lock().calls.subscribes += 1;
        Ok(())
    }

    fn unsubscribe_event(&self, _kind: EventKind) -> Result<(), DeviceError> {
        Ok(())
    }

    fn dequeue_event(&self) -> Result<Event, DeviceError> {
        self.state
            .lock()
            .events
            .pop_front()
            .ok_or_else(|| DeviceError::from_errno("VIDIOC_DQEVENT", ENOENT))
    }

    fn query_dv_timings(&self) -> Result<DvTimings, DeviceError> {
        let mut state = self.state.lock();
        state.calls.timings_queries += 1;
        match state.timings_errors.pop_front() {
            Some(code) => Err(DeviceError::from_errno("VIDIOC_QUERY_DV_TIMINGS", code)),
            None => Ok(state.timings),
        }
    }

    fn set_dv_timings(&self, timings: &DvTimings) -> Result<DvTimings, DeviceError> {
        self.state.lock().calls.timings_sets += 1;
        Ok(*timings)
    }

    fn formats(&self) -> Result<Vec<FormatDesc>, DeviceError> {
        Ok(self
            .state
            .lock()
            .formats
            .iter()
            .enumerate()
            .map(|(index, fourcc)| FormatDesc {
                index: index as u32,
                flags: 0,
                description: fourcc.to_string(),
                fourcc: *fourcc,
            })
            .collect())
    }

    fn try_format(&self, format: &PixFormat) -> Result<PixFormat, DeviceError> {
        let mut state = self.state.lock();
        state.calls.try_formats += 1;
        Ok(state.adjust(format))
    }

    fn set_format(&self, format: &PixFormat) -> Result<PixFormat, DeviceError> {
        let mut state = self.state.lock();
        state.calls.set_formats += 1;
        if let Some(code) = state.set_format_errors.pop_front() {
            return Err(DeviceError::from_errno("VIDIOC_S_FMT", code));
        }
        if state.streaming || state.granted > 0 {
            return Err(DeviceError::from_errno("VIDIOC_S_FMT", EBUSY));
        }
        let committed = state.adjust(format);
        state.format = Some(committed);
        Ok(committed)
    }

    fn format(&self) -> Result<PixFormat, DeviceError> {
        self.state.lock().format.ok_or_else(|| DeviceError::from_errno("VIDIOC_G_FMT", EINVAL))
    }

    fn request_buffers(&self, count: u32) -> Result<u32, DeviceError> {
        let mut state = self.state.lock();
        state.calls.request_buffers.push(count);
        if state.streaming {
            return Err(DeviceError::from_errno("VIDIOC_REQBUFS", EBUSY));
        }
        if count == 0 {
            if let Some(code) = state.release_errors.pop_front() {
                return Err(DeviceError::from_errno("VIDIOC_REQBUFS", code));
            }
            if !state.mapped.is_empty() {
                return Err(DeviceError::from_errno("VIDIOC_REQBUFS", EBUSY));
            }
            state.granted = 0;
            state.queued.clear();
            return Ok(0);
        }
        state.granted = count.min(state.max_grant);
        if state.granted == 0 {
            return Err(DeviceError::NoBuffersAllocated);
        }
        Ok(state.granted)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferInfo, DeviceError> {
        let mut state = self.state.lock();
        state.calls.buffer_queries += 1;
        if state.fail_query_at == Some(index) {
            state.fail_query_at = None;
            return Err(DeviceError::from_errno("VIDIOC_QUERYBUF", EINVAL));
        }
        if index >= state.granted {
            return Err(DeviceError::BufferIndex(index));
        }
        Ok(BufferInfo {
            index,
            offset: index * state.buffer_len,
            length: state.buffer_len,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> Result<SimMapping, DeviceError> {
        self.state.lock().mapped.push(info.index);
        Ok(SimMapping {
            index: info.index,
            bytes: vec![SimMapping::fill(info.index); info.length as usize].into_boxed_slice(),
            state: self.state.clone(),
            mapped: true,
        })
    }

    fn queue_buffer(&self, index: u32) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if index >= state.granted {
            return Err(DeviceError::BufferIndex(index));
        }
        if !state.queued.contains(&index) {
            state.queued.push_back(index);
        }
        Ok(())
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer, DeviceError> {
        let mut state = self.state.lock();
        state.calls.dequeues += 1;
        if !state.streaming {
            return Err(DeviceError::from_errno("VIDIOC_DQBUF", EINVAL));
        }
        let (bytes_used, flags) = match state.pending.front() {
            Some(SimStep::Frame { bytes_used }) => (*bytes_used, 0),
            Some(SimStep::ErrorFrame { bytes_used }) => {
                (*bytes_used, bindings::V4L2_BUF_FLAG_ERROR)
            }
            Some(SimStep::DequeueError { errno }) => {
                let errno = *errno;
                state.input_reported = false;
                return Err(DeviceError::from_errno("VIDIOC_DQBUF", errno));
            }
            _ => return Err(DeviceError::from_errno("VIDIOC_DQBUF", EAGAIN)),
        };
        let Some(index) = state.queued.pop_front() else {
            return Err(DeviceError::from_errno("VIDIOC_DQBUF", EAGAIN));
        };
        state.pending.pop_front();
        state.input_reported = false;
        let sequence = state.sequence;
        state.sequence += 1;
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            flags,
            sequence,
            field: Field::Progressive,
            timestamp: Duration::from_millis(sequence as u64 * 16),
        })
    }

    fn stream_on(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.granted == 0 {
            return Err(DeviceError::from_errno("VIDIOC_STREAMON", EINVAL));
        }
        state.calls.stream_ons += 1;
        state.streaming = true;
        state.input_reported = false;
        let phase = state.phases.pop_front().unwrap_or_default();
        state.pending = phase.into();
        Ok(())
    }

    fn stream_off(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.calls.stream_offs += 1;
        state.streaming = false;
        state.pending.clear();
        state.queued.clear();
        Ok(())
    }

    fn poll(&self, interest: Interest, timeout: Duration) -> Result<Readiness, DeviceError> {
        {
            let mut state = self.state.lock();
            if state.streaming {
                state.skip_lost();
                let error = state.pending.front() == Some(&SimStep::Hangup);
                if error {
                    state.pending.pop_front();
                    state.skip_lost();
                }
                if state.pending.front() == Some(&SimStep::SourceChange) {
                    state.pending.pop_front();
                    state.events.push_back(Event::SourceChange {
                        changes: bindings::V4L2_EVENT_SRC_CH_RESOLUTION,
                    });
                }
                let priority = interest.priority && !state.events.is_empty();
                let input = interest.input
                    && !state.input_reported
                    && match state.pending.front() {
                        Some(SimStep::Frame { .. } | SimStep::ErrorFrame { .. }) => {
                            !state.queued.is_empty()
                        }
                        Some(SimStep::DequeueError { .. }) => true,
                        _ => false,
                    };
                if input {
                    state.input_reported = true;
                }
                if priority || input || error {
                    return Ok(Readiness {
                        input,
                        priority,
                        error,
                    });
                }
            }
        }
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Ok(Readiness::default())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.streaming = false;
        state.granted = 0;
        state.pending.clear();
        state.queued.clear();
        state.events.clear();
    }
}

/// Mapping of a simulated kernel buffer; every byte equals [`SimMapping::fill`] of its index.
pub struct SimMapping {
    index: u32,
    bytes: Box<[u8]>,
    state: Arc<Mutex<SimState>>,
    mapped: bool,
}

impl SimMapping {
    pub fn fill(index: u32) -> u8 {
        (index as u8).wrapping_add(1)
    }

    fn release(&mut self) {
        if !self.mapped {
            return;
        }
        self.mapped = false;
        let mut state = self.state.lock();
        state.mapped.retain(|i| *i != self.index);
        state.unmapped.push(self.index);
    }
}

impl MappedRegion for SimMapping {
    fn index(&self) -> u32 {
        self.index
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn unmap(mut self) -> Result<(), DeviceError> {
        self.release();
        Ok(())
    }
}

impl Drop for SimMapping {
    fn drop(&mut self) {
        self.release();
    }
}
