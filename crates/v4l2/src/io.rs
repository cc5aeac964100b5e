//! Syscall plumbing around the typed device-control calls: open, `EINTR` retry and poll.

use std::{
    fs::{self, File, OpenOptions},
    os::{
        fd::{AsRawFd, BorrowedFd, OwnedFd},
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::Path,
    time::Duration,
};

use v4l2r::ioctl::IntoErrno;

use crate::error::DeviceError;

/// Open a capture node non-blocking after checking it is a character device.
pub fn open_device(path: &Path) -> Result<OwnedFd, DeviceError> {
    let meta = fs::metadata(path).map_err(|source| DeviceError::Os { op: "stat", source })?;
    if !meta.file_type().is_char_device() {
        return Err(DeviceError::NotCharDevice(path.to_path_buf()));
    }
    let file: File = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| DeviceError::Os { op: "open", source })?;
    Ok(file.into())
}

/// Run one device-control call, reissuing it while it fails with `EINTR`.
///
/// Every error of the typed wrappers converts to its errno, which is what
/// the [`ErrorKind`](crate::error::ErrorKind) taxonomy classifies.
pub fn restart_interrupted<T, E: IntoErrno>(
    op: &'static str,
    mut call: impl FnMut() -> Result<T, E>,
) -> Result<T, DeviceError> {
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let errno = err.into_errno();
                if errno != libc::EINTR {
                    return Err(DeviceError::from_errno(op, errno));
                }
            }
        }
    }
}

/// Readiness classes to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    /// A filled buffer can be dequeued.
    pub input: bool,
    /// An event is pending.
    pub priority: bool,
}

impl Interest {
    pub const CAPTURE: Interest = Interest {
        input: true,
        priority: true,
    };

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.input {
            events |= libc::POLLIN;
        }
        if self.priority {
            events |= libc::POLLPRI;
        }
        events
    }
}

/// Result of one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub input: bool,
    pub priority: bool,
    /// The descriptor reported an error or hang-up condition.
    pub error: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.input || self.priority || self.error)
    }
}

/// Wait up to `timeout` for readiness; an elapsed timeout yields an empty [`Readiness`].
pub fn poll_fd(
    fd: BorrowedFd<'_>,
    interest: Interest,
    timeout: Duration,
) -> Result<Readiness, DeviceError> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: interest.events(),
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
    let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
    if ret < 0 {
        let err = DeviceError::last_os("poll");
        if err.errno() == Some(libc::EINTR) {
            return Ok(Readiness::default());
        }
        return Err(err);
    }
    let revents = pfd.revents;
    Ok(Readiness {
        input: revents & libc::POLLIN != 0,
        priority: revents & libc::POLLPRI != 0,
        error: revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
    })
}
