use std::{
    fmt,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    time::Duration,
};

use hdcap_core::prelude::FourCc;
use v4l2r::{
    QueueType, bindings,
    ioctl::{
        self, Capability, EventType, MemoryConsistency, PlaneMapping, QueryBuffer,
        SubscribeEventFlags, UncheckedV4l2Buffer,
    },
    memory::MemoryType,
};

use crate::{
    error::{DeviceError, ErrorKind},
    io::{self, Interest, Readiness, restart_interrupted},
    types::{
        BufferInfo, Capabilities, DequeuedBuffer, DvTimings, Event, EventKind, FormatDesc,
        PixFormat,
    },
};

/// A kernel buffer mapped into the process.
pub trait MappedRegion: Send + Sync {
    /// Kernel buffer index this region is bound to.
    fn index(&self) -> u32;
    fn as_slice(&self) -> &[u8];
    /// Unbind the region. Dropping without calling this unbinds as well.
    fn unmap(self) -> Result<(), DeviceError>;
}

/// Capture operations over one open device.
///
/// Every call is a synchronous request/response; errors carry the
/// [`ErrorKind`] taxonomy so callers can decide which ones to retry.
pub trait VideoDevice: Send + Sync {
    type Mapping: MappedRegion;

    fn capabilities(&self) -> Result<Capabilities, DeviceError>;

    fn subscribe_event(&self, kind: EventKind) -> Result<(), DeviceError>;
    fn unsubscribe_event(&self, kind: EventKind) -> Result<(), DeviceError>;
    fn dequeue_event(&self) -> Result<Event, DeviceError>;

    /// Detect the timings of the incoming signal.
    fn query_dv_timings(&self) -> Result<DvTimings, DeviceError>;
    /// Commit timings; returns what the driver accepted.
    fn set_dv_timings(&self, timings: &DvTimings) -> Result<DvTimings, DeviceError>;

    fn formats(&self) -> Result<Vec<FormatDesc>, DeviceError>;
    fn try_format(&self, format: &PixFormat) -> Result<PixFormat, DeviceError>;
    fn set_format(&self, format: &PixFormat) -> Result<PixFormat, DeviceError>;
    fn format(&self) -> Result<PixFormat, DeviceError>;

    /// Request `count` mmap buffers and return how many were granted.
    ///
    /// A count of zero releases every buffer; otherwise a grant of zero is
    /// reported as [`DeviceError::NoBuffersAllocated`].
    fn request_buffers(&self, count: u32) -> Result<u32, DeviceError>;
    fn query_buffer(&self, index: u32) -> Result<BufferInfo, DeviceError>;
    fn map_buffer(&self, info: &BufferInfo) -> Result<Self::Mapping, DeviceError>;
    fn queue_buffer(&self, index: u32) -> Result<(), DeviceError>;
    fn dequeue_buffer(&self) -> Result<DequeuedBuffer, DeviceError>;

    fn stream_on(&self) -> Result<(), DeviceError>;
    /// Stop streaming; every queued and filled buffer returns to the driver unseen.
    fn stream_off(&self) -> Result<(), DeviceError>;

    /// Bounded wait for readiness.
    fn poll(&self, interest: Interest, timeout: Duration) -> Result<Readiness, DeviceError>;

    /// Exact four-character-code lookup in the device's format list.
    fn find_format(&self, fourcc: FourCc) -> Result<FormatDesc, DeviceError> {
        self.formats()?
            .into_iter()
            .find(|desc| desc.fourcc == fourcc)
            .ok_or(DeviceError::UnsupportedFormat(fourcc))
    }
}

/// Something that can (re)open a capture device.
pub trait DeviceNode: Send + Sync + 'static {
    type Device: VideoDevice;

    fn open(&self) -> Result<Self::Device, DeviceError>;
    /// Human-readable location used in logs.
    fn describe(&self) -> String;
}

/// Reject devices that cannot stream captured video.
pub fn require_capture(caps: &Capabilities) -> Result<(), DeviceError> {
    if !caps.video_capture() {
        return Err(DeviceError::UnsupportedCapture);
    }
    if !caps.streaming() {
        return Err(DeviceError::UnsupportedStreaming);
    }
    Ok(())
}

/// Filesystem path of a capture node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V4l2Node {
    path: PathBuf,
}

impl V4l2Node {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceNode for V4l2Node {
    type Device = V4l2Device;

    fn open(&self) -> Result<V4l2Device, DeviceError> {
        V4l2Device::open(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Open capture device; the descriptor closes on drop.
pub struct V4l2Device {
    fd: OwnedFd,
    path: PathBuf,
}

impl V4l2Device {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let fd = io::open_device(path)?;
        tracing::debug!(path = %path.display(), "opened capture node");
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn event_type(kind: EventKind) -> EventType {
        match kind {
            EventKind::SourceChange => EventType::SourceChange(0),
        }
    }
}

impl AsFd for V4l2Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for V4l2Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4l2Device").field("path", &self.path).finish()
    }
}

impl VideoDevice for V4l2Device {
    type Mapping = MappedBuffer;

    fn capabilities(&self) -> Result<Capabilities, DeviceError> {
        let cap =
            restart_interrupted("VIDIOC_QUERYCAP", || ioctl::querycap::<Capability>(&self.fd))?;
        Ok(Capabilities::from(cap))
    }

    fn subscribe_event(&self, kind: EventKind) -> Result<(), DeviceError> {
        restart_interrupted("VIDIOC_SUBSCRIBE_EVENT", || {
            ioctl::subscribe_event(&self.fd, Self::event_type(kind), SubscribeEventFlags::empty())
        })
    }

    fn unsubscribe_event(&self, kind: EventKind) -> Result<(), DeviceError> {
        restart_interrupted("VIDIOC_UNSUBSCRIBE_EVENT", || {
            ioctl::unsubscribe_event(&self.fd, Self::event_type(kind))
        })
    }

    fn dequeue_event(&self) -> Result<Event, DeviceError> {
        // Raw event: unknown event types still dequeue and are reported as `Other`.
        let raw = restart_interrupted("VIDIOC_DQEVENT", || {
            ioctl::dqevent::<bindings::v4l2_event>(&self.fd)
        })?;
        Ok(Event::from(raw))
    }

    fn query_dv_timings(&self) -> Result<DvTimings, DeviceError> {
        let raw = restart_interrupted("VIDIOC_QUERY_DV_TIMINGS", || {
            ioctl::query_dv_timings::<bindings::v4l2_dv_timings>(&self.fd)
        })?;
        Ok(DvTimings::from(raw))
    }

    fn set_dv_timings(&self, timings: &DvTimings) -> Result<DvTimings, DeviceError> {
        let raw = restart_interrupted("VIDIOC_S_DV_TIMINGS", || {
            ioctl::s_dv_timings::<_, bindings::v4l2_dv_timings>(&self.fd, *timings)
        })?;
        Ok(DvTimings::from(raw))
    }

    fn formats(&self) -> Result<Vec<FormatDesc>, DeviceError> {
        let mut out = Vec::new();
        for index in 0.. {
            let desc = restart_interrupted("VIDIOC_ENUM_FMT", || {
                ioctl::enum_fmt::<bindings::v4l2_fmtdesc>(&self.fd, QueueType::VideoCapture, index)
            });
            match desc {
                Ok(raw) => out.push(FormatDesc::from(raw)),
                // End of list.
                Err(err) if err.is(ErrorKind::BadArgument) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn try_format(&self, format: &PixFormat) -> Result<PixFormat, DeviceError> {
        let raw = restart_interrupted("VIDIOC_TRY_FMT", || {
            let raw = bindings::v4l2_format::from(*format);
            ioctl::try_fmt::<_, bindings::v4l2_format>(&self.fd, raw)
        })?;
        Ok(PixFormat::from(raw))
    }

    fn set_format(&self, format: &PixFormat) -> Result<PixFormat, DeviceError> {
        let mut fd = self.fd.as_fd();
        let raw = restart_interrupted("VIDIOC_S_FMT", || {
            ioctl::s_fmt::<_, bindings::v4l2_format>(&mut fd, bindings::v4l2_format::from(*format))
        })?;
        Ok(PixFormat::from(raw))
    }

    fn format(&self) -> Result<PixFormat, DeviceError> {
        let raw = restart_interrupted("VIDIOC_G_FMT", || {
            ioctl::g_fmt::<bindings::v4l2_format>(&self.fd, QueueType::VideoCapture)
        })?;
        Ok(PixFormat::from(raw))
    }

    fn request_buffers(&self, count: u32) -> Result<u32, DeviceError> {
        let granted = restart_interrupted("VIDIOC_REQBUFS", || {
            ioctl::reqbufs::<bindings::v4l2_requestbuffers>(
                &self.fd,
                QueueType::VideoCapture,
                MemoryType::Mmap,
                count,
                MemoryConsistency::empty(),
            )
        })?
        .count;
        if count > 0 && granted == 0 {
            return Err(DeviceError::NoBuffersAllocated);
        }
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferInfo, DeviceError> {
        let info = restart_interrupted("VIDIOC_QUERYBUF", || {
            ioctl::querybuf::<QueryBuffer>(&self.fd, QueueType::VideoCapture, index as usize)
        })?;
        // Single-planar capture: exactly one plane.
        let plane = info.planes.first().ok_or(DeviceError::BufferIndex(index))?;
        Ok(BufferInfo {
            index,
            offset: plane.mem_offset,
            length: plane.length,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> Result<MappedBuffer, DeviceError> {
        let mapping =
            restart_interrupted("mmap", || ioctl::mmap(&self.fd, info.offset, info.length))?;
        Ok(MappedBuffer {
            mapping,
            index: info.index,
        })
    }

    fn queue_buffer(&self, index: u32) -> Result<(), DeviceError> {
        restart_interrupted("VIDIOC_QBUF", || {
            let raw = bindings::v4l2_buffer {
                index,
                type_: QueueType::VideoCapture as u32,
                memory: MemoryType::Mmap as u32,
                ..Default::default()
            };
            ioctl::qbuf::<_, ()>(&self.fd, UncheckedV4l2Buffer(raw, None))
        })
    }

    fn dequeue_buffer(&self) -> Result<DequeuedBuffer, DeviceError> {
        let buffer = restart_interrupted("VIDIOC_DQBUF", || {
            ioctl::dqbuf::<UncheckedV4l2Buffer>(&self.fd, QueueType::VideoCapture)
        })?;
        Ok(DequeuedBuffer::from(&buffer.0))
    }

    fn stream_on(&self) -> Result<(), DeviceError> {
        restart_interrupted("VIDIOC_STREAMON", || {
            ioctl::streamon(&self.fd, QueueType::VideoCapture)
        })
    }

    fn stream_off(&self) -> Result<(), DeviceError> {
        restart_interrupted("VIDIOC_STREAMOFF", || {
            ioctl::streamoff(&self.fd, QueueType::VideoCapture)
        })
    }

    fn poll(&self, interest: Interest, timeout: Duration) -> Result<Readiness, DeviceError> {
        io::poll_fd(self.fd.as_fd(), interest, timeout)
    }
}

/// Shared read/write mapping of one kernel capture buffer; unmapped on drop.
pub struct MappedBuffer {
    mapping: PlaneMapping,
    index: u32,
}

impl MappedBuffer {
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

impl MappedRegion for MappedBuffer {
    fn index(&self) -> u32 {
        self.index
    }

    fn as_slice(&self) -> &[u8] {
        &self.mapping
    }

    fn unmap(self) -> Result<(), DeviceError> {
        tracing::trace!(index = self.index, len = self.len(), "unmapping capture buffer");
        drop(self.mapping);
        Ok(())
    }
}

impl fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_without_streaming_is_rejected() {
        let mut caps = Capabilities::capture_and_streaming("bridge");
        assert!(require_capture(&caps).is_ok());
        caps.flags &= !bindings::V4L2_CAP_STREAMING;
        assert_eq!(require_capture(&caps).unwrap_err().code(), "unsupported_streaming");
        caps.flags = bindings::V4L2_CAP_STREAMING;
        assert_eq!(require_capture(&caps).unwrap_err().code(), "unsupported_capture");
    }

    #[test]
    fn node_describes_its_path() {
        let node = V4l2Node::new("/dev/video0");
        assert_eq!(node.describe(), "/dev/video0");
        assert_eq!(node.path(), Path::new("/dev/video0"));
    }
}
