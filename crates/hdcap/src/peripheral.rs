use std::{fmt, sync::Arc};

use hdcap_capture::prelude::{
    CaptureConfig, CaptureDevice, CaptureError, DeviceNode, DisplayMode, DisplaySource,
    FrameBuffer, PixelFormat, Pool, PoolError, PoolProvider, V4l2Node, default_pool,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AgentConfig;

/// Capabilities a KVM peripheral can expose to the rest of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Produces frames of a remote display.
    DisplaySource,
    /// Consumes frames for output.
    DisplaySink,
}

/// Set of [`Role`]s a peripheral implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roles {
    display_source: bool,
    display_sink: bool,
}

impl Roles {
    pub const NONE: Roles = Roles {
        display_source: false,
        display_sink: false,
    };
    pub const DISPLAY_SOURCE: Roles = Roles {
        display_source: true,
        display_sink: false,
    };

    pub fn with(mut self, role: Role) -> Self {
        match role {
            Role::DisplaySource => self.display_source = true,
            Role::DisplaySink => self.display_sink = true,
        }
        self
    }

    pub fn contains(self, role: Role) -> bool {
        match role {
            Role::DisplaySource => self.display_source,
            Role::DisplaySink => self.display_sink,
        }
    }
}

/// Where a peripheral gets its frame pool from.
#[derive(Clone)]
pub enum PoolSource {
    /// Use this pool.
    Explicit(Pool),
    /// Ask a provider at open time.
    Provider(PoolProvider),
}

impl Default for PoolSource {
    /// The process-wide default pool.
    fn default() -> Self {
        PoolSource::Provider(default_pool)
    }
}

impl fmt::Debug for PoolSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolSource::Explicit(pool) => f.debug_tuple("Explicit").field(pool).finish(),
            PoolSource::Provider(_) => f.write_str("Provider"),
        }
    }
}

impl From<Pool> for PoolSource {
    fn from(pool: Pool) -> Self {
        PoolSource::Explicit(pool)
    }
}

impl PoolSource {
    pub fn resolve(self) -> Result<Pool, PoolError> {
        match self {
            PoolSource::Explicit(pool) => Ok(pool),
            PoolSource::Provider(provider) => provider(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeripheralError {
    #[error("peripheral does not implement {0:?}")]
    RoleUnsupported(Role),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl PeripheralError {
    pub fn code(&self) -> &'static str {
        match self {
            PeripheralError::RoleUnsupported(_) => "role_unsupported",
            PeripheralError::Capture(err) => err.code(),
            PeripheralError::Pool(err) => err.code(),
        }
    }
}

/// HDMI capture peripheral: a capture device feeding a [`DisplaySource`].
///
/// The peripheral owns the device control loop; dropping it (or cancelling
/// the parent token) stops capture and releases every buffer.
pub struct Peripheral {
    roles: Roles,
    source: Arc<DisplaySource>,
    device: CaptureDevice,
}

impl Peripheral {
    /// Open the V4L2 node named in `config`.
    pub fn open(
        config: &AgentConfig,
        pool: PoolSource,
        parent: &CancellationToken,
    ) -> Result<Self, PeripheralError> {
        let node = V4l2Node::new(&config.capture.device);
        Self::open_with(node, config.capture.clone(), pool, parent)
    }

    /// Open any device node, e.g. a simulated one.
    pub fn open_with<N: DeviceNode>(
        node: N,
        config: CaptureConfig,
        pool: PoolSource,
        parent: &CancellationToken,
    ) -> Result<Self, PeripheralError> {
        let pool = pool.resolve()?;
        let source = Arc::new(DisplaySource::new(config.pixel_format));
        let device = CaptureDevice::open(node, config, pool, source.clone(), parent)?;
        info!(device = device.describe(), format = %device.pixel_format(), "peripheral opened");
        Ok(Self {
            roles: Roles::DISPLAY_SOURCE,
            source,
            device,
        })
    }

    pub fn roles(&self) -> Roles {
        self.roles
    }

    /// Fail unless this peripheral implements `role`.
    pub fn require(&self, role: Role) -> Result<(), PeripheralError> {
        if self.roles.contains(role) {
            Ok(())
        } else {
            Err(PeripheralError::RoleUnsupported(role))
        }
    }

    pub fn display_source(&self) -> &DisplaySource {
        &self.source
    }

    pub fn display_mode(&self) -> Option<DisplayMode> {
        self.source.display_mode()
    }

    /// Latest captured frame, retained for the caller.
    pub fn display_frame_buffer(&self) -> Result<FrameBuffer, PeripheralError> {
        Ok(self.source.display_frame_buffer()?)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.source.pixel_format()
    }

    pub fn device(&self) -> &CaptureDevice {
        &self.device
    }

    /// Stop capture and wait for the device to release its resources.
    pub fn shutdown(self) {
        self.device.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use hdcap_capture::sim::{SimNode, SimStep};

    use super::*;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn config() -> CaptureConfig {
        CaptureConfig::new("sim").with_restart_delay(Duration::from_millis(10))
    }

    #[test]
    fn roles_are_a_capability_set() {
        assert!(!Roles::NONE.contains(Role::DisplaySource));
        assert!(Roles::DISPLAY_SOURCE.contains(Role::DisplaySource));
        assert!(!Roles::DISPLAY_SOURCE.contains(Role::DisplaySink));
        let both = Roles::DISPLAY_SOURCE.with(Role::DisplaySink);
        assert!(both.contains(Role::DisplaySink));
    }

    #[test]
    fn missing_provider_pool_fails_open() {
        fn no_pool() -> Result<Pool, PoolError> {
            Err(PoolError::DefaultPoolMissing)
        }
        let err = Peripheral::open_with(
            SimNode::new(),
            config(),
            PoolSource::Provider(no_pool),
            &CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PeripheralError::Pool(PoolError::DefaultPoolMissing)));
    }

    #[test]
    fn capture_peripheral_is_only_a_display_source() {
        let pool = Pool::new(4096, 3).unwrap();
        let node = SimNode::new().push_phase([SimStep::Frame { bytes_used: 512 }]);
        let lifetime = CancellationToken::new();
        let peripheral =
            Peripheral::open_with(node, config(), pool.clone().into(), &lifetime).unwrap();

        assert!(peripheral.require(Role::DisplaySource).is_ok());
        let err = peripheral.require(Role::DisplaySink).unwrap_err();
        assert_eq!(err.code(), "role_unsupported");
        assert_eq!(peripheral.pixel_format(), PixelFormat::Rgb24);

        assert!(wait_until(|| peripheral.display_frame_buffer().is_ok()));
        let frame = peripheral.display_frame_buffer().unwrap();
        assert_eq!(frame.len(), 512);
        assert_eq!(peripheral.display_mode().unwrap().to_string(), "1920x1080@60");
        frame.release().unwrap();

        peripheral.shutdown();
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn parent_cancellation_stops_capture() {
        let pool = Pool::new(4096, 2).unwrap();
        let parent = CancellationToken::new();
        let node = SimNode::new().push_phase([SimStep::Frame { bytes_used: 16 }]);
        let peripheral =
            Peripheral::open_with(node.clone(), config(), pool.clone().into(), &parent).unwrap();
        assert!(wait_until(|| node.is_streaming()));

        parent.cancel();
        assert!(wait_until(|| !node.is_streaming()));
        assert!(peripheral.device().lifetime().is_cancelled());
        peripheral.shutdown();
        assert_eq!(pool.stats().outstanding, 0);
    }
}
