use hdcap_core::prelude::{DisplayMode, FrameBuffer, PixelFormat};
use parking_lot::RwLock;

use crate::{
    error::CaptureError,
    handler::{CapturedFrame, FrameHandler, HandlerError},
};

/// Frame handler that keeps the latest frame for a display-source consumer.
///
/// The capture loop swaps the current frame under a write lock; readers
/// retain it under a read lock, so a reader never observes a released buffer.
///
/// # Example
/// ```rust
/// use hdcap_capture::prelude::*;
///
/// let pool = Pool::new(16, 2).unwrap();
/// let source = DisplaySource::new(PixelFormat::Rgb24);
/// let mut buffer = pool.borrow(3).unwrap();
/// buffer.write(&[1, 2, 3]).unwrap();
/// let meta = FrameMeta {
///     sequence: 0,
///     field: Field::Progressive,
///     timestamp: Default::default(),
///     bytes_used: 3,
///     mode: None,
/// };
/// source.handle(CapturedFrame { buffer, meta }).unwrap();
///
/// let frame = source.display_frame_buffer().unwrap();
/// assert_eq!(&*frame.data(), &[1, 2, 3]);
/// assert_eq!(frame.ref_count(), 2);
/// frame.release().unwrap();
/// ```
#[derive(Debug)]
pub struct DisplaySource {
    current: RwLock<Option<FrameBuffer>>,
    mode: RwLock<Option<DisplayMode>>,
    pixel_format: PixelFormat,
}

impl DisplaySource {
    pub fn new(pixel_format: PixelFormat) -> Self {
        Self {
            current: RwLock::new(None),
            mode: RwLock::new(None),
            pixel_format,
        }
    }

    /// Negotiated mode, absent until a signal has been negotiated.
    pub fn display_mode(&self) -> Option<DisplayMode> {
        *self.mode.read()
    }

    /// Retain the current frame on the caller's behalf.
    pub fn display_frame_buffer(&self) -> Result<FrameBuffer, CaptureError> {
        let current = self.current.read();
        let frame = current.as_ref().ok_or(CaptureError::NotReady)?;
        Ok(frame.retain()?)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Drop the current frame, releasing this source's reference.
    pub fn clear(&self) {
        let previous = self.current.write().take();
        if let Some(frame) = previous
            && let Err(err) = frame.release()
        {
            tracing::warn!(error = %err, "failed to release display frame");
        }
    }
}

impl FrameHandler for DisplaySource {
    fn handle(&self, frame: CapturedFrame) -> Result<(), HandlerError> {
        let previous = self.current.write().replace(frame.buffer);
        if let Some(previous) = previous {
            previous.release()?;
        }
        Ok(())
    }

    fn on_mode_change(&self, mode: Option<DisplayMode>) {
        *self.mode.write() = mode;
        if mode.is_none() {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use hdcap_core::prelude::{Pool, Resolution};
    use hdcap_v4l2::prelude::Field;

    use super::*;
    use crate::handler::FrameMeta;

    fn frame(pool: &Pool, byte: u8) -> CapturedFrame {
        let mut buffer = pool.borrow(1).unwrap();
        buffer.write(&[byte]).unwrap();
        CapturedFrame {
            buffer,
            meta: FrameMeta {
                sequence: byte as u32,
                field: Field::Progressive,
                timestamp: Default::default(),
                bytes_used: 1,
                mode: None,
            },
        }
    }

    #[test]
    fn not_ready_before_first_frame() {
        let source = DisplaySource::new(PixelFormat::Rgb24);
        assert!(matches!(source.display_frame_buffer(), Err(CaptureError::NotReady)));
        assert_eq!(source.pixel_format(), PixelFormat::Rgb24);
    }

    #[test]
    fn replacing_releases_previous_frame() {
        let pool = Pool::new(4, 2).unwrap();
        let source = DisplaySource::new(PixelFormat::Rgb24);
        source.handle(frame(&pool, 1)).unwrap();
        source.handle(frame(&pool, 2)).unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        source.handle(frame(&pool, 3)).unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        let current = source.display_frame_buffer().unwrap();
        assert_eq!(current.to_vec(), vec![3]);
    }

    #[test]
    fn reader_keeps_frame_alive_across_swap() {
        let pool = Pool::new(4, 2).unwrap();
        let source = DisplaySource::new(PixelFormat::Rgb24);
        source.handle(frame(&pool, 7)).unwrap();
        let reader = source.display_frame_buffer().unwrap();
        source.handle(frame(&pool, 8)).unwrap();
        assert_eq!(reader.to_vec(), vec![7]);
        assert_eq!(reader.ref_count(), 1);
        reader.release().unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn mode_loss_clears_frame() {
        let pool = Pool::new(4, 2).unwrap();
        let source = DisplaySource::new(PixelFormat::Rgb24);
        let mode = DisplayMode::new(Resolution::new(1280, 720).unwrap(), 60.0);
        source.on_mode_change(Some(mode));
        source.handle(frame(&pool, 1)).unwrap();
        assert_eq!(source.display_mode(), Some(mode));
        source.on_mode_change(None);
        assert_eq!(source.display_mode(), None);
        assert_eq!(pool.stats().idle, 2);
    }
}
