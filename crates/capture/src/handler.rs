use std::time::Duration;

use hdcap_core::prelude::{DisplayMode, FrameBuffer};
use hdcap_v4l2::prelude::Field;

/// Error type returned by frame handlers; logged by the capture loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Metadata captured alongside each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Driver sequence number.
    pub sequence: u32,
    pub field: Field,
    /// Driver timestamp.
    pub timestamp: Duration,
    pub bytes_used: usize,
    /// Mode negotiated for the stream this frame belongs to.
    pub mode: Option<DisplayMode>,
}

/// One captured frame; the buffer holds a single reference owned by the receiver.
#[derive(Debug)]
pub struct CapturedFrame {
    pub buffer: FrameBuffer,
    pub meta: FrameMeta,
}

/// Consumer of captured frames.
///
/// `handle` takes ownership of the frame's buffer reference and must release
/// it exactly once, directly or by passing it on (dropping the handle
/// releases it). A returned error is logged and capture continues.
///
/// # Example
/// ```rust
/// use hdcap_capture::prelude::*;
///
/// let handler = |frame: CapturedFrame| -> Result<(), HandlerError> {
///     println!("frame {} ({} bytes)", frame.meta.sequence, frame.buffer.len());
///     frame.buffer.release()?;
///     Ok(())
/// };
/// let _boxed: std::sync::Arc<dyn FrameHandler> = std::sync::Arc::new(handler);
/// ```
pub trait FrameHandler: Send + Sync + 'static {
    fn handle(&self, frame: CapturedFrame) -> Result<(), HandlerError>;

    /// Called with `None` when re-negotiation starts and with the new mode once committed.
    fn on_mode_change(&self, _mode: Option<DisplayMode>) {}
}

impl<F> FrameHandler for F
where
    F: Fn(CapturedFrame) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, frame: CapturedFrame) -> Result<(), HandlerError> {
        self(frame)
    }
}
