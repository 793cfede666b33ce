//! Readiness multiplexer abstraction
//!
//! The event loop drives a [`Poller`], not epoll directly, so loop
//! behaviour can be tested with a scriptable fake. Production is
//! [`EpollPoller`] on Linux.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::sys::cvt;

/// Which readiness directions an fd is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const fn read() -> Self {
        Interest { readable: true, writable: false }
    }

    pub const fn write() -> Self {
        Interest { readable: false, writable: true }
    }

    pub const fn none() -> Self {
        Interest { readable: false, writable: false }
    }

    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// One readiness report from a poll.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup condition on the fd.
    pub error: bool,
}

pub trait Poller: Send {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` for readiness, appending results to `out`.
    ///
    /// An interrupted wait reports zero events rather than an error.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<usize>;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {

        const MAX_EVENTS: usize = 256;

        /// epoll-backed production poller.
        pub struct EpollPoller {
            epfd: OwnedFd,
            events: Vec<libc::epoll_event>,
        }

        impl EpollPoller {
            pub fn new() -> io::Result<Self> {
                let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
                Ok(EpollPoller {
                    epfd: unsafe { OwnedFd::from_raw_fd(fd) },
                    events: Vec::with_capacity(MAX_EVENTS),
                })
            }

            fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
                let mut ev = libc::epoll_event {
                    events: interest_bits(interest),
                    u64: fd as u64,
                };
                cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) })?;
                Ok(())
            }
        }

        fn interest_bits(interest: Interest) -> u32 {
            let mut bits = 0u32;
            if interest.readable {
                bits |= libc::EPOLLIN as u32;
            }
            if interest.writable {
                bits |= libc::EPOLLOUT as u32;
            }
            bits
        }

        impl Poller for EpollPoller {
            fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
                self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
            }

            fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
                self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
            }

            fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
                let mut ev = libc::epoll_event { events: 0, u64: 0 };
                cvt(unsafe {
                    libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev)
                })?;
                Ok(())
            }

            fn wait(
                &mut self,
                timeout: Option<Duration>,
                out: &mut Vec<ReadyEvent>,
            ) -> io::Result<usize> {
                let timeout_ms = match timeout {
                    Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
                    None => -1,
                };
                self.events.clear();
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd.as_raw_fd(),
                        self.events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout_ms,
                    )
                };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err);
                }
                unsafe { self.events.set_len(n as usize) };

                for ev in &self.events {
                    out.push(ReadyEvent {
                        fd: ev.u64 as RawFd,
                        readable: ev.events & libc::EPOLLIN as u32 != 0,
                        writable: ev.events & libc::EPOLLOUT as u32 != 0,
                        error: ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
                    });
                }
                Ok(n as usize)
            }
        }
    }
}

/// Scriptable poller for loop tests: queue readiness with
/// [`push_ready`](FakePoller::push_ready), then each `wait` drains what
/// was queued for registered fds.
#[derive(Default)]
pub struct FakePoller {
    registered: HashMap<RawFd, Interest>,
    queued: VecDeque<ReadyEvent>,
}

impl FakePoller {
    pub fn new() -> Self {
        FakePoller::default()
    }

    pub fn push_ready(&mut self, ev: ReadyEvent) {
        self.queued.push_back(ev);
    }

    pub fn interest_of(&self, fd: RawFd) -> Option<Interest> {
        self.registered.get(&fd).copied()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }
}

impl Poller for FakePoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.registered.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.registered.get_mut(&fd) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self.registered.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn wait(&mut self, _timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<usize> {
        let mut n = 0;
        while let Some(ev) = self.queued.pop_front() {
            if self.registered.contains_key(&ev.fd) {
                out.push(ev);
                n += 1;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_delivers_only_registered_fds() {
        let mut poller = FakePoller::new();
        poller.register(3, Interest::read()).unwrap();
        poller.push_ready(ReadyEvent { fd: 3, readable: true, writable: false, error: false });
        poller.push_ready(ReadyEvent { fd: 9, readable: true, writable: false, error: false });

        let mut out = Vec::new();
        let n = poller.wait(None, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].fd, 3);
    }

    #[test]
    fn fake_tracks_modify_and_unregister() {
        let mut poller = FakePoller::new();
        poller.register(5, Interest::read()).unwrap();
        poller.modify(5, Interest::write()).unwrap();
        assert_eq!(poller.interest_of(5), Some(Interest::write()));
        poller.unregister(5).unwrap();
        assert!(poller.unregister(5).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn epoll_reports_pipe_readability() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [rd, wr] = fds;

        let mut poller = EpollPoller::new().unwrap();
        poller.register(rd, Interest::read()).unwrap();

        let mut out = Vec::new();
        let n = poller
            .wait(Some(Duration::from_millis(10)), &mut out)
            .unwrap();
        assert_eq!(n, 0);

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);
        let n = poller
            .wait(Some(Duration::from_millis(100)), &mut out)
            .unwrap();
        assert_eq!(n, 1);
        assert!(out[0].readable);
        assert_eq!(out[0].fd, rd);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
