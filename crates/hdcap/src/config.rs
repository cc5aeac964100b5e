use std::path::PathBuf;

use hdcap_capture::prelude::{CaptureConfig, CaptureError, PixelFormat, Pool, PoolError};

/// Default number of frame buffers in the agent's pool.
pub const DEFAULT_POOL_BUFFERS: usize = 6;
/// Default bytes per pool buffer; fits 1920x1080 RGB24 with room for 4K YUYV.
pub const DEFAULT_POOL_BUFFER_BYTES: usize = 8 << 20;

pub const ENV_DEVICE: &str = "HDCAP_DEVICE";
pub const ENV_PIXEL_FORMAT: &str = "HDCAP_PIXEL_FORMAT";
pub const ENV_POOL_BUFFERS: &str = "HDCAP_POOL_BUFFERS";
pub const ENV_POOL_BUFFER_BYTES: &str = "HDCAP_POOL_BUFFER_BYTES";
pub const ENV_KERNEL_BUFFERS: &str = "HDCAP_KERNEL_BUFFERS";

/// Errors loading or validating agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("pool needs at least one buffer of at least one byte")]
    EmptyPool,
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

impl ConfigError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::InvalidValue { .. } => "invalid_value",
            ConfigError::EmptyPool => "empty_pool",
            ConfigError::Capture(err) => err.code(),
        }
    }
}

/// Agent configuration: capture settings plus frame pool sizing.
///
/// # Example
/// ```rust
/// use hdcap::prelude::*;
///
/// let config = AgentConfig::from_lookup(|key| match key {
///     "HDCAP_DEVICE" => Some("/dev/video1".into()),
///     "HDCAP_POOL_BUFFERS" => Some("3".into()),
///     _ => None,
/// })
/// .unwrap();
/// assert_eq!(config.capture.device.to_str(), Some("/dev/video1"));
/// assert_eq!(config.pool_buffers, 3);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AgentConfig {
    pub capture: CaptureConfig,
    pub pool_buffers: usize,
    pub pool_buffer_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            pool_buffers: DEFAULT_POOL_BUFFERS,
            pool_buffer_bytes: DEFAULT_POOL_BUFFER_BYTES,
        }
    }
}

fn parse<T>(var: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
        var,
        reason: err.to_string(),
        value: raw,
    })
}

impl AgentConfig {
    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_pool_buffers(mut self, count: usize) -> Self {
        self.pool_buffers = count;
        self
    }

    pub fn with_pool_buffer_bytes(mut self, bytes: usize) -> Self {
        self.pool_buffer_bytes = bytes;
        self
    }

    /// Load from `HDCAP_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(device) = lookup(ENV_DEVICE) {
            config.capture.device = PathBuf::from(device);
        }
        if let Some(raw) = lookup(ENV_PIXEL_FORMAT) {
            config.capture.pixel_format = parse::<PixelFormat>(ENV_PIXEL_FORMAT, raw)?;
        }
        if let Some(raw) = lookup(ENV_POOL_BUFFERS) {
            config.pool_buffers = parse(ENV_POOL_BUFFERS, raw)?;
        }
        if let Some(raw) = lookup(ENV_POOL_BUFFER_BYTES) {
            config.pool_buffer_bytes = parse(ENV_POOL_BUFFER_BYTES, raw)?;
        }
        if let Some(raw) = lookup(ENV_KERNEL_BUFFERS) {
            config.capture.kernel_buffers = parse(ENV_KERNEL_BUFFERS, raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_buffers == 0 || self.pool_buffer_bytes == 0 {
            return Err(ConfigError::EmptyPool);
        }
        self.capture.validate()?;
        Ok(())
    }

    /// Allocate the frame pool described by this configuration.
    pub fn build_pool(&self) -> Result<Pool, PoolError> {
        Pool::new(self.pool_buffer_bytes, self.pool_buffers)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.capture.kernel_buffers, 4);
    }

    #[test]
    fn every_variable_is_applied() {
        let config = AgentConfig::from_lookup(lookup(&[
            (ENV_DEVICE, "/dev/video3"),
            (ENV_PIXEL_FORMAT, "yuyv"),
            (ENV_POOL_BUFFERS, "10"),
            (ENV_POOL_BUFFER_BYTES, "4096"),
            (ENV_KERNEL_BUFFERS, " 6 "),
        ]))
        .unwrap();
        assert_eq!(config.capture.device, PathBuf::from("/dev/video3"));
        assert_eq!(config.capture.pixel_format, PixelFormat::Yuyv);
        assert_eq!(config.pool_buffers, 10);
        assert_eq!(config.pool_buffer_bytes, 4096);
        assert_eq!(config.capture.kernel_buffers, 6);
        assert_eq!(config.build_pool().unwrap().capacity(), 10);
    }

    #[test]
    fn invalid_values_fail_fast() {
        let err = AgentConfig::from_lookup(lookup(&[(ENV_POOL_BUFFERS, "many")])).unwrap_err();
        assert_eq!(err.code(), "invalid_value");
        assert!(err.to_string().starts_with("HDCAP_POOL_BUFFERS"));

        let err = AgentConfig::from_lookup(lookup(&[(ENV_PIXEL_FORMAT, "rgb565")])).unwrap_err();
        assert_eq!(err.code(), "invalid_value");

        let err = AgentConfig::from_lookup(lookup(&[(ENV_POOL_BUFFERS, "0")])).unwrap_err();
        assert_eq!(err.code(), "empty_pool");

        let err = AgentConfig::from_lookup(lookup(&[(ENV_DEVICE, "")])).unwrap_err();
        assert_eq!(err.code(), "invalid_config");
    }
}
