use std::{fmt, io, path::PathBuf};

use hdcap_core::prelude::FourCc;

/// Closed classification of OS-level failures.
///
/// A single errno may belong to several kinds: `EAGAIN` is both a would-block
/// and a timeout, and every timeout is also temporary. Use
/// [`DeviceError::is`] to test membership rather than comparing [`DeviceError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Structural or fatal failure (bad descriptor, no memory, I/O fault).
    System,
    BadArgument,
    Temporary,
    Timeout,
    Interrupted,
    Busy,
    NoEntity,
    /// Cable present but link not up, or the receiver has no lock on the signal.
    NoLink,
    WouldBlock,
}

impl ErrorKind {
    /// Whether a raw errno belongs to this kind.
    pub fn contains_errno(self, errno: i32) -> bool {
        match self {
            ErrorKind::Interrupted => errno == libc::EINTR,
            ErrorKind::BadArgument => errno == libc::EINVAL,
            ErrorKind::Busy => errno == libc::EBUSY,
            ErrorKind::NoEntity => errno == libc::ENOENT,
            ErrorKind::NoLink => errno == libc::ENOLINK || errno == libc::ENOLCK,
            ErrorKind::WouldBlock => errno == libc::EAGAIN,
            ErrorKind::Timeout => errno == libc::ETIMEDOUT || errno == libc::EAGAIN,
            ErrorKind::Temporary => matches!(
                errno,
                libc::EINTR | libc::EMFILE | libc::ENFILE | libc::EAGAIN | libc::ETIMEDOUT
            ),
            ErrorKind::System => ![
                ErrorKind::Interrupted,
                ErrorKind::BadArgument,
                ErrorKind::Busy,
                ErrorKind::NoEntity,
                ErrorKind::NoLink,
                ErrorKind::Timeout,
                ErrorKind::Temporary,
            ]
            .iter()
            .any(|kind| kind.contains_errno(errno)),
        }
    }

    /// Most specific kind for an errno.
    pub fn of_errno(errno: i32) -> ErrorKind {
        [
            ErrorKind::Interrupted,
            ErrorKind::BadArgument,
            ErrorKind::Busy,
            ErrorKind::NoEntity,
            ErrorKind::NoLink,
            ErrorKind::WouldBlock,
            ErrorKind::Timeout,
            ErrorKind::Temporary,
        ]
        .into_iter()
        .find(|kind| kind.contains_errno(errno))
        .unwrap_or(ErrorKind::System)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::System => "system",
            ErrorKind::BadArgument => "bad argument",
            ErrorKind::Temporary => "temporary",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Busy => "busy",
            ErrorKind::NoEntity => "no entity",
            ErrorKind::NoLink => "no link",
            ErrorKind::WouldBlock => "resource temporarily unavailable",
        };
        f.write_str(name)
    }
}

/// Errors from the device I/O and capture binding layers.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a character device")]
    NotCharDevice(PathBuf),
    #[error("device does not support video capture")]
    UnsupportedCapture,
    #[error("device does not support streaming i/o")]
    UnsupportedStreaming,
    #[error("kernel granted no buffers")]
    NoBuffersAllocated,
    #[error("pixel format {0} not offered by device")]
    UnsupportedFormat(FourCc),
    #[error("unsupported digital video timings type {0}")]
    UnsupportedTimings(u32),
    #[error("kernel buffer index {0} out of range")]
    BufferIndex(u32),
    #[error("{op} failed after {attempts} attempt(s): {source}")]
    Failed {
        op: &'static str,
        attempts: u32,
        #[source]
        source: Box<DeviceError>,
    },
    #[error("{op} cancelled after {attempts} attempt(s): {source}")]
    Cancelled {
        op: &'static str,
        attempts: u32,
        #[source]
        source: Box<DeviceError>,
    },
    #[error("{op} retry window exhausted after {attempts} attempt(s): {source}")]
    DeadlineExceeded {
        op: &'static str,
        attempts: u32,
        #[source]
        source: Box<DeviceError>,
    },
}

impl DeviceError {
    /// Wrap the calling thread's last OS error.
    pub fn last_os(op: &'static str) -> Self {
        DeviceError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        DeviceError::Os {
            op,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// Raw errno of the innermost OS error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            DeviceError::Os { source, .. } => source.raw_os_error(),
            DeviceError::Failed { source, .. }
            | DeviceError::Cancelled { source, .. }
            | DeviceError::DeadlineExceeded { source, .. } => source.errno(),
            _ => None,
        }
    }

    /// Membership test against the taxonomy; wrapped errors delegate to their cause.
    pub fn is(&self, kind: ErrorKind) -> bool {
        match self.errno() {
            Some(errno) => kind.contains_errno(errno),
            None => match self {
                DeviceError::Os { .. } => kind == ErrorKind::System,
                _ => false,
            },
        }
    }

    /// Most specific kind; protocol mismatches are classified as [`ErrorKind::System`].
    pub fn kind(&self) -> ErrorKind {
        self.errno()
            .map(ErrorKind::of_errno)
            .unwrap_or(ErrorKind::System)
    }

    /// Number of attempts recorded by a retry wrapper, or 1.
    pub fn attempts(&self) -> u32 {
        match self {
            DeviceError::Failed { attempts, .. }
            | DeviceError::Cancelled { attempts, .. }
            | DeviceError::DeadlineExceeded { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::Os { .. } => "os_error",
            DeviceError::NotCharDevice(_) => "not_char_device",
            DeviceError::UnsupportedCapture => "unsupported_capture",
            DeviceError::UnsupportedStreaming => "unsupported_streaming",
            DeviceError::NoBuffersAllocated => "no_buffers_allocated",
            DeviceError::UnsupportedFormat(_) => "unsupported_format",
            DeviceError::UnsupportedTimings(_) => "unsupported_timings",
            DeviceError::BufferIndex(_) => "buffer_index",
            DeviceError::Failed { .. } => "retry_failed",
            DeviceError::Cancelled { .. } => "retry_cancelled",
            DeviceError::DeadlineExceeded { .. } => "retry_deadline",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eagain_is_both_timeout_and_would_block() {
        let err = DeviceError::from_errno("VIDIOC_DQBUF", libc::EAGAIN);
        assert!(err.is(ErrorKind::Timeout));
        assert!(err.is(ErrorKind::WouldBlock));
        assert!(err.is(ErrorKind::Temporary));
        assert!(!err.is(ErrorKind::System));
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn enolck_reports_no_link() {
        let err = DeviceError::from_errno("VIDIOC_QUERY_DV_TIMINGS", libc::ENOLCK);
        assert!(err.is(ErrorKind::NoLink));
        assert_eq!(err.kind(), ErrorKind::NoLink);
    }

    #[test]
    fn unknown_errno_is_system() {
        let err = DeviceError::from_errno("open", libc::ENODEV);
        assert!(err.is(ErrorKind::System));
        assert!(!err.is(ErrorKind::Busy));
        assert_eq!(err.code(), "os_error");
    }

    #[test]
    fn wrapped_errors_delegate_membership() {
        let inner = DeviceError::from_errno("VIDIOC_S_FMT", libc::EBUSY);
        let err = DeviceError::Failed {
            op: "VIDIOC_S_FMT",
            attempts: 3,
            source: Box::new(inner),
        };
        assert!(err.is(ErrorKind::Busy));
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.code(), "retry_failed");
    }

    #[test]
    fn protocol_errors_match_no_kind() {
        assert!(!DeviceError::UnsupportedCapture.is(ErrorKind::System));
        assert!(!DeviceError::NoBuffersAllocated.is(ErrorKind::Temporary));
    }
}
