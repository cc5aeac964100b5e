#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod format;
pub mod metrics;

pub mod prelude {
    pub use crate::{
        buffer::{
            BufferId, FrameBuffer, Pool, PoolError, PoolMetrics, PoolProvider, PoolStats,
            default_pool, install_default_pool,
        },
        format::{DisplayMode, FourCc, PixelFormat, Resolution},
        metrics::Metrics,
    };
}
