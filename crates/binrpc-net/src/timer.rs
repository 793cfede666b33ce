//! Deadline-ordered timer heap backed by a timerfd
//!
//! The heap is shared across threads behind a mutex; the owning loop
//! registers the timerfd for readability and calls
//! [`TimerHeap::fire`] when it trips. Cancellation is lazy: the handle
//! flips a flag and the entry is skipped when its deadline pops.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::NetError;
use crate::sys::cvt;

type TimerCallback = Box<dyn FnMut() + Send>;

/// Cancellation handle for a scheduled timer.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct TimerEntry {
    /// Re-arm period; `None` for one-shot timers.
    interval: Option<Duration>,
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

struct HeapInner {
    /// Keyed by `(deadline, seq)` so equal deadlines keep insert order.
    entries: BTreeMap<(Instant, u64), TimerEntry>,
    seq: u64,
}

pub struct TimerHeap {
    inner: Mutex<HeapInner>,
    timerfd: TimerFd,
}

impl TimerHeap {
    pub fn new() -> Result<Self, NetError> {
        Ok(TimerHeap {
            inner: Mutex::new(HeapInner {
                entries: BTreeMap::new(),
                seq: 0,
            }),
            timerfd: TimerFd::new().map_err(NetError::TimerFdCreate)?,
        })
    }

    /// Schedule `callback` to run after `delay`. Repeating timers are
    /// re-armed at fire time plus `delay`.
    pub fn add(
        &self,
        delay: Duration,
        repeat: bool,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            interval: repeat.then_some(delay),
            cancelled: cancelled.clone(),
            callback: Box::new(callback),
        };

        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let earliest_before = inner.entries.keys().next().map(|(d, _)| *d);
        let seq = inner.seq;
        inner.seq += 1;
        inner.entries.insert((deadline, seq), entry);

        // An earlier deadline than anything pending needs the timerfd
        // re-armed now, not at the next fire.
        if earliest_before.map_or(true, |d| deadline < d) {
            self.timerfd.arm_at(deadline);
        }
        trace!(?delay, repeat, "timer added");

        TimerHandle { cancelled }
    }

    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    /// Run every entry due at `now`. Callbacks execute with the lock
    /// released; repeating entries go back in at `now + interval`.
    pub fn fire(&self, now: Instant) {
        let due = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let later = inner.entries.split_off(&(now, u64::MAX));
            std::mem::replace(&mut inner.entries, later)
        };

        for (_, mut entry) in due {
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            (entry.callback)();
            if let Some(interval) = entry.interval {
                if !entry.cancelled.load(Ordering::Acquire) {
                    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                    let seq = inner.seq;
                    inner.seq += 1;
                    inner.entries.insert((now + interval, seq), entry);
                }
            }
        }

        // One re-arm after the batch, for whatever is now earliest.
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.keys().next() {
            Some((deadline, _)) => self.timerfd.arm_at(*deadline),
            None => self.timerfd.disarm(),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.timerfd.fd.as_raw_fd()
    }

    /// Reset the timerfd expiry counter after a readiness event.
    pub fn drain(&self) {
        self.timerfd.drain();
    }
}

/// Owned non-blocking timerfd on the monotonic clock.
struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    fn new() -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        Ok(TimerFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn arm_at(&self, deadline: Instant) {
        // A deadline already in the past still needs one tick.
        let delay = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_nanos(1));
        self.settime(delay);
    }

    fn disarm(&self) {
        self.settime(Duration::ZERO);
    }

    fn settime(&self, delay: Duration) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret < 0 {
            warn!(
                fd = self.fd.as_raw_fd(),
                err = %io::Error::last_os_error(),
                "timerfd_settime failed"
            );
        }
    }

    fn drain(&self) {
        let mut expirations: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut expirations as *mut u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if n < 0 {
                break;
            }
        }
    }
}
