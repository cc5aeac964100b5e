#![doc = include_str!("../README.md")]

pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod metrics;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod source;
pub mod stage;
mod stream;

pub mod prelude {
    pub use crate::{
        config::CaptureConfig,
        device::CaptureDevice,
        error::CaptureError,
        handler::{CapturedFrame, FrameHandler, FrameMeta, HandlerError},
        metrics::{CaptureStats, StageMetrics},
        source::DisplaySource,
        stage::Stage,
    };
    pub use hdcap_core::prelude::*;
    pub use hdcap_v4l2::prelude::{DeviceError, DeviceNode, ErrorKind, Field, V4l2Node};
}
