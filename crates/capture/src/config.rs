use std::{path::PathBuf, time::Duration};

use hdcap_core::prelude::PixelFormat;

use crate::error::CaptureError;

/// Default capture node.
pub const DEFAULT_DEVICE: &str = "/dev/video0";
/// Kernel buffers requested on every memory initialisation.
pub const DEFAULT_KERNEL_BUFFERS: u32 = 4;
/// Upper bound accepted for the kernel buffer count.
pub const MAX_KERNEL_BUFFERS: u32 = 32;
/// Window for detecting and committing signal timings.
pub const DEFAULT_TIMINGS_WINDOW: Duration = Duration::from_secs(10);
/// Window for dequeuing one filled buffer.
pub const DEFAULT_DEQUEUE_WINDOW: Duration = Duration::from_millis(100);
/// Window for dequeuing one event.
pub const DEFAULT_EVENT_WINDOW: Duration = Duration::from_millis(500);
/// Window for format commit and buffer release while the driver reports busy.
pub const DEFAULT_BUSY_WINDOW: Duration = Duration::from_secs(1);
/// Bounded wait inside the poll producer.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Readiness notifications buffered between poller and stream loop.
pub const DEFAULT_POLL_DEPTH: usize = 8;
/// Pause between control-loop restarts.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(250);

/// Capture device configuration.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use hdcap_capture::prelude::*;
///
/// let config = CaptureConfig::new("/dev/video2")
///     .with_pixel_format(PixelFormat::Yuyv)
///     .with_kernel_buffers(0)
///     .with_poll_interval(Duration::from_secs(30))
///     .sanitized();
/// assert_eq!(config.kernel_buffers, 1);
/// assert_eq!(config.poll_interval, Duration::from_secs(1));
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CaptureConfig {
    pub device: PathBuf,
    pub pixel_format: PixelFormat,
    pub kernel_buffers: u32,
    pub timings_window: Duration,
    pub dequeue_window: Duration,
    pub event_window: Duration,
    pub busy_window: Duration,
    pub poll_interval: Duration,
    pub poll_depth: usize,
    pub restart_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            pixel_format: PixelFormat::Rgb24,
            kernel_buffers: DEFAULT_KERNEL_BUFFERS,
            timings_window: DEFAULT_TIMINGS_WINDOW,
            dequeue_window: DEFAULT_DEQUEUE_WINDOW,
            event_window: DEFAULT_EVENT_WINDOW,
            busy_window: DEFAULT_BUSY_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_depth: DEFAULT_POLL_DEPTH,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl CaptureConfig {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn with_kernel_buffers(mut self, count: u32) -> Self {
        self.kernel_buffers = count;
        self
    }

    pub fn with_timings_window(mut self, window: Duration) -> Self {
        self.timings_window = window;
        self
    }

    pub fn with_dequeue_window(mut self, window: Duration) -> Self {
        self.dequeue_window = window;
        self
    }

    pub fn with_event_window(mut self, window: Duration) -> Self {
        self.event_window = window;
        self
    }

    pub fn with_busy_window(mut self, window: Duration) -> Self {
        self.busy_window = window;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_depth(mut self, depth: usize) -> Self {
        self.poll_depth = depth;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Clamp values into ranges the control loop can work with.
    ///
    /// The poll interval stays within 1ms..=1s so cancellation is observed promptly.
    pub fn sanitized(self) -> Self {
        Self {
            kernel_buffers: self.kernel_buffers.clamp(1, MAX_KERNEL_BUFFERS),
            poll_interval: self
                .poll_interval
                .clamp(Duration::from_millis(1), Duration::from_secs(1)),
            poll_depth: self.poll_depth.max(1),
            ..self
        }
    }

    /// Reject configurations that can never open a device.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.device.as_os_str().is_empty() {
            return Err(CaptureError::InvalidConfig("device path is empty".into()));
        }
        Ok(())
    }
}
