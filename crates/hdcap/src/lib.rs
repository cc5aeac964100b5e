#![doc = include_str!("../README.md")]

pub use hdcap_capture as capture;
pub use hdcap_core as core;
pub use hdcap_v4l2 as v4l2;

pub mod config;
pub mod logging;
pub mod peripheral;

pub mod prelude {
    pub use crate::{
        config::{AgentConfig, ConfigError},
        peripheral::{Peripheral, PeripheralError, PoolSource, Role, Roles},
    };
    pub use hdcap_capture::prelude::*;
    pub use hdcap_v4l2::prelude::{DvTimings, V4l2DeviceInfo, probe_devices};
}
