//! Cross-thread loop wakeup over an eventfd

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::warn;

use crate::sys::{cvt, cvt_n};

/// Owned eventfd. Any thread may [`notify`](Self::notify); the loop
/// thread drains it when readable.
pub struct WakeupFd {
    fd: OwnedFd,
}

impl WakeupFd {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        Ok(WakeupFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Wake the owning loop. A full counter already wakes it, so
    /// EAGAIN is not an error.
    pub fn notify(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!(fd = self.fd.as_raw_fd(), %err, "wakeup write failed");
            }
        }
    }

    /// Reset the counter after a readiness event.
    pub fn drain(&self) {
        let mut count: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut count as *mut u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            match cvt_n(n) {
                Ok(_) => continue,
                Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => break,
                Err(err) => {
                    warn!(fd = self.fd.as_raw_fd(), %err, "wakeup drain failed");
                    break;
                }
            }
        }
    }
}
