use hdcap_core::prelude::PoolError;
use hdcap_v4l2::prelude::{DeviceError, ErrorKind};

/// Errors raised by the capture device and its consumers.
///
/// # Example
/// ```rust
/// use hdcap_capture::prelude::*;
///
/// let source = DisplaySource::new(PixelFormat::Rgb24);
/// let err = source.display_frame_buffer().unwrap_err();
/// assert_eq!(err.code(), "not_ready");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("stream already active")]
    AlreadyStreaming,
    #[error("no active stream")]
    NotStreaming,
    #[error("no frame captured yet")]
    NotReady,
    #[error("negotiated geometry {width}x{height} is empty")]
    InvalidGeometry { width: u32, height: u32 },
    #[error("device reported an error condition while streaming")]
    Hangup,
    #[error("stream worker panicked")]
    WorkerPanicked,
    #[error("capture config rejected: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl CaptureError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::Device(err) => err.code(),
            CaptureError::Pool(err) => err.code(),
            CaptureError::AlreadyStreaming => "already_streaming",
            CaptureError::NotStreaming => "not_streaming",
            CaptureError::NotReady => "not_ready",
            CaptureError::InvalidGeometry { .. } => "invalid_geometry",
            CaptureError::Hangup => "hangup",
            CaptureError::WorkerPanicked => "worker_panicked",
            CaptureError::InvalidConfig(_) => "invalid_config",
            CaptureError::Spawn(_) => "spawn_failed",
        }
    }

    /// Whether the error is transient at the OS level.
    pub fn retryable(&self) -> bool {
        match self {
            CaptureError::Device(err) => [
                ErrorKind::Temporary,
                ErrorKind::Timeout,
                ErrorKind::Busy,
                ErrorKind::NoLink,
                ErrorKind::Interrupted,
            ]
            .iter()
            .any(|kind| err.is(*kind)),
            CaptureError::NotReady | CaptureError::Hangup => true,
            _ => false,
        }
    }
}
