#![doc = include_str!("../README.md")]

pub mod device;
pub mod error;
pub mod io;
pub mod poll;
pub mod probe;
pub mod retry;
pub mod types;

/// Raw kernel structures and constants, generated from `linux/videodev2.h`.
pub use v4l2r::bindings;

pub mod prelude {
    pub use crate::{
        device::{
            DeviceNode, MappedBuffer, MappedRegion, V4l2Device, V4l2Node, VideoDevice,
            require_capture,
        },
        error::{DeviceError, ErrorKind},
        io::{Interest, Readiness, open_device, poll_fd, restart_interrupted},
        poll::{PollEvent, spawn_poller},
        probe::{V4l2DeviceInfo, probe_devices},
        retry::{retry_with_backoff, wait_or_cancel},
        types::{
            BufferInfo, Capabilities, DequeuedBuffer, DvTimings, Event, EventKind, Field,
            FormatDesc, PixFormat,
        },
    };
}
