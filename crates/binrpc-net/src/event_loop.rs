//! Per-thread event loop
//!
//! The loop owns its poller and fd registrations; both stay on the
//! thread that calls [`EventLoop::run`]. Other threads interact only
//! through a [`LoopHandle`]: posted tasks run at the top of the next
//! iteration, timers go through the shared [`TimerHeap`], and an
//! eventfd kicks the poller out of its wait.
//!
//! Readiness callbacks are collected first and invoked after the fd
//! table borrow is released, so a callback may freely register or
//! deregister events on the same loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::{debug, error, trace, warn};

use crate::error::NetError;
#[cfg(target_os = "linux")]
use crate::poller::EpollPoller;
use crate::poller::{Interest, Poller, ReadyEvent};
use crate::timer::{TimerHandle, TimerHeap};
use crate::wakeup::WakeupFd;

/// Upper bound on one poller wait; wakeups cut it short.
const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Work posted to a loop from any thread, executed on the loop thread.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

type Callback = Rc<dyn Fn()>;

/// Registration record for one fd: which directions are armed and what
/// runs when they trip. Shared between the loop's fd table and the
/// owner of the fd.
pub struct FdEvent {
    fd: RawFd,
    interest: Cell<Interest>,
    read_cb: RefCell<Option<Callback>>,
    write_cb: RefCell<Option<Callback>>,
    error_cb: RefCell<Option<Callback>>,
}

impl FdEvent {
    pub fn new(fd: RawFd) -> Rc<Self> {
        Rc::new(FdEvent {
            fd,
            interest: Cell::new(Interest::none()),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    pub fn set_interest(&self, interest: Interest) {
        self.interest.set(interest);
    }

    pub fn set_read(&self, cb: impl Fn() + 'static) {
        *self.read_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_write(&self, cb: impl Fn() + 'static) {
        *self.write_cb.borrow_mut() = Some(Rc::new(cb));
    }

    pub fn set_error(&self, cb: impl Fn() + 'static) {
        *self.error_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Run the error callback as if the poller had reported a failure
    /// on this fd. Lets an owner drive the same teardown path a real
    /// error would.
    pub fn fire_error(&self) {
        if let Some(cb) = self.callback(&self.error_cb) {
            cb();
        }
    }

    /// Drop all callbacks, releasing whatever they captured.
    pub fn clear_callbacks(&self) {
        self.read_cb.borrow_mut().take();
        self.write_cb.borrow_mut().take();
        self.error_cb.borrow_mut().take();
    }

    fn callback(&self, slot: &RefCell<Option<Callback>>) -> Option<Callback> {
        slot.borrow().clone()
    }
}

struct LoopShared {
    tasks: SegQueue<Task>,
    timers: TimerHeap,
    wakeup: WakeupFd,
    quit: AtomicBool,
    running: AtomicBool,
}

/// Cross-thread handle to a loop. Cheap to clone.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Queue `task` for the loop thread and wake it.
    pub fn post(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.tasks.push(Box::new(task));
        self.shared.wakeup.notify();
    }

    /// Schedule `callback` after `delay`; repeating timers re-arm at
    /// fire time plus `delay`.
    pub fn schedule(
        &self,
        delay: Duration,
        repeat: bool,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        self.shared.timers.add(delay, repeat, callback)
    }

    pub fn cancel(&self, handle: &TimerHandle) {
        self.shared.timers.cancel(handle);
    }

    /// Ask the loop to exit after its current iteration.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.wakeup.notify();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn wakeup(&self) {
        self.shared.wakeup.notify();
    }

    /// Stable identity of the underlying loop, for routing decisions.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }
}

struct LoopInner {
    shared: Arc<LoopShared>,
    poller: RefCell<Box<dyn Poller>>,
    events: RefCell<HashMap<RawFd, Rc<FdEvent>>>,
}

/// The loop itself. Not `Send`: it is cloned and used only on the
/// thread that runs it.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Build a loop over the production epoll poller.
    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Self, NetError> {
        Self::with_poller(Box::new(
            EpollPoller::new().map_err(NetError::PollerCreate)?,
        ))
    }

    /// Build a loop over a caller-supplied poller (tests use the fake).
    pub fn with_poller(poller: Box<dyn Poller>) -> Result<Self, NetError> {
        let shared = Arc::new(LoopShared {
            tasks: SegQueue::new(),
            timers: TimerHeap::new()?,
            wakeup: WakeupFd::new().map_err(NetError::WakeupCreate)?,
            quit: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });
        let lp = EventLoop {
            inner: Rc::new(LoopInner {
                shared,
                poller: RefCell::new(poller),
                events: RefCell::new(HashMap::new()),
            }),
        };
        lp.register_internal_events()?;
        Ok(lp)
    }

    /// Always-registered readiness sources: the wakeup eventfd and the
    /// timer heap's timerfd.
    fn register_internal_events(&self) -> Result<(), NetError> {
        let shared = self.inner.shared.clone();
        let wakeup_event = FdEvent::new(shared.wakeup.raw_fd());
        wakeup_event.set_interest(Interest::read());
        wakeup_event.set_read({
            let shared = shared.clone();
            move || shared.wakeup.drain()
        });
        self.add_event(&wakeup_event)?;

        let timer_event = FdEvent::new(shared.timers.raw_fd());
        timer_event.set_interest(Interest::read());
        timer_event.set_read({
            let shared = shared.clone();
            move || {
                shared.timers.drain();
                shared.timers.fire(Instant::now());
            }
        });
        self.add_event(&timer_event)?;
        Ok(())
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.inner.shared.clone(),
        }
    }

    /// Register `event` with its current interest, or update the
    /// registration if the fd is already known.
    pub fn add_event(&self, event: &Rc<FdEvent>) -> Result<(), NetError> {
        let mut events = self.inner.events.borrow_mut();
        let mut poller = self.inner.poller.borrow_mut();
        let fd = event.fd();
        if events.contains_key(&fd) {
            poller
                .modify(fd, event.interest())
                .map_err(|source| NetError::Register { fd, source })?;
        } else {
            poller
                .register(fd, event.interest())
                .map_err(|source| NetError::Register { fd, source })?;
            events.insert(fd, event.clone());
        }
        trace!(fd, interest = ?event.interest(), "fd event updated");
        Ok(())
    }

    /// Look up the registration for `fd`, if any.
    pub fn event_for(&self, fd: RawFd) -> Option<Rc<FdEvent>> {
        self.inner.events.borrow().get(&fd).cloned()
    }

    /// Drop the registration for `event`. Unknown fds are a no-op.
    pub fn remove_event(&self, event: &Rc<FdEvent>) {
        let fd = event.fd();
        let removed = self.inner.events.borrow_mut().remove(&fd).is_some();
        if !removed {
            return;
        }
        if let Err(err) = self.inner.poller.borrow_mut().unregister(fd) {
            warn!(fd, %err, "fd deregistration failed");
        }
        trace!(fd, "fd event removed");
    }

    /// Run until [`LoopHandle::stop`] is called. Must be invoked on the
    /// thread the loop belongs to; a second concurrent call is refused.
    pub fn run(&self) {
        if self.inner.shared.running.swap(true, Ordering::AcqRel) {
            warn!("event loop already running");
            return;
        }
        debug!("event loop started");
        while !self.inner.shared.quit.load(Ordering::Acquire) {
            self.poll_once(Some(DEFAULT_WAIT));
        }
        // Tasks posted between the last poll and stop still run.
        self.drain_tasks();
        self.inner.shared.running.store(false, Ordering::Release);
        debug!("event loop stopped");
    }

    /// One iteration: drain posted tasks, wait for readiness, dispatch
    /// callbacks with the fd table borrow released.
    pub fn poll_once(&self, timeout: Option<Duration>) {
        self.drain_tasks();
        if self.inner.shared.quit.load(Ordering::Acquire) {
            return;
        }

        let mut ready: Vec<ReadyEvent> = Vec::new();
        if let Err(err) = self.inner.poller.borrow_mut().wait(timeout, &mut ready) {
            error!(%err, "poller wait failed");
            return;
        }

        let mut pending: Vec<Callback> = Vec::new();
        let mut errored: Vec<RawFd> = Vec::new();
        {
            let events = self.inner.events.borrow();
            for ev in &ready {
                let Some(fde) = events.get(&ev.fd) else {
                    continue;
                };
                if ev.readable {
                    if let Some(cb) = fde.callback(&fde.read_cb) {
                        pending.push(cb);
                    }
                }
                if ev.writable {
                    if let Some(cb) = fde.callback(&fde.write_cb) {
                        pending.push(cb);
                    }
                }
                if ev.error {
                    if let Some(cb) = fde.callback(&fde.error_cb) {
                        pending.push(cb);
                    }
                    errored.push(ev.fd);
                }
            }
        }

        // An errored fd is dropped from the table before callbacks run.
        for fd in errored {
            let fde = self.inner.events.borrow().get(&fd).cloned();
            if let Some(fde) = fde {
                self.remove_event(&fde);
            }
        }
        for cb in pending {
            cb();
        }
    }

    fn drain_tasks(&self) {
        while let Some(task) = self.inner.shared.tasks.pop() {
            task(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::FakePoller;
    use std::io;
    use std::sync::Mutex;

    /// FakePoller behind a lock so the test keeps a scripting handle
    /// after the loop takes ownership.
    struct SharedFake(Arc<Mutex<FakePoller>>);

    impl Poller for SharedFake {
        fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.0.lock().unwrap().register(fd, interest)
        }
        fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.0.lock().unwrap().modify(fd, interest)
        }
        fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
            self.0.lock().unwrap().unregister(fd)
        }
        fn wait(
            &mut self,
            timeout: Option<Duration>,
            out: &mut Vec<ReadyEvent>,
        ) -> io::Result<usize> {
            self.0.lock().unwrap().wait(timeout, out)
        }
    }

    fn fake_loop() -> (EventLoop, Arc<Mutex<FakePoller>>) {
        let fake = Arc::new(Mutex::new(FakePoller::new()));
        let lp = EventLoop::with_poller(Box::new(SharedFake(fake.clone()))).unwrap();
        (lp, fake)
    }

    #[test]
    fn posted_task_runs_on_poll() {
        let (lp, _fake) = fake_loop();
        let handle = lp.handle();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        handle.post(move |_lp| done2.store(true, Ordering::SeqCst));
        lp.poll_once(Some(Duration::ZERO));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn ready_fd_invokes_read_callback() {
        let (lp, fake) = fake_loop();
        let event = FdEvent::new(99);
        event.set_interest(Interest::read());
        let count = Rc::new(Cell::new(0));
        event.set_read({
            let count = count.clone();
            move || count.set(count.get() + 1)
        });
        lp.add_event(&event).unwrap();
        assert!(lp.event_for(99).is_some());
        assert!(lp.event_for(100).is_none());

        fake.lock().unwrap().push_ready(ReadyEvent {
            fd: 99,
            readable: true,
            writable: false,
            error: false,
        });
        lp.poll_once(Some(Duration::ZERO));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn callback_may_deregister_its_own_fd() {
        let (lp, fake) = fake_loop();
        let event = FdEvent::new(42);
        event.set_interest(Interest::read());
        event.set_read({
            let lp = lp.clone();
            let event_fd = 42;
            move || {
                // Re-borrowing the fd table from inside a callback must
                // not panic.
                let probe = FdEvent::new(event_fd);
                lp.remove_event(&probe);
            }
        });
        lp.add_event(&event).unwrap();
        fake.lock().unwrap().push_ready(ReadyEvent {
            fd: 42,
            readable: true,
            writable: false,
            error: false,
        });
        lp.poll_once(Some(Duration::ZERO));
        // Internal events (wakeup + timerfd) remain, the fd is gone.
        assert_eq!(fake.lock().unwrap().registered_count(), 2);
    }

    #[test]
    fn errored_fd_is_dropped_and_error_callback_runs() {
        let (lp, fake) = fake_loop();
        let event = FdEvent::new(7);
        event.set_interest(Interest::read());
        let hit = Rc::new(Cell::new(false));
        event.set_error({
            let hit = hit.clone();
            move || hit.set(true)
        });
        lp.add_event(&event).unwrap();

        fake.lock().unwrap().push_ready(ReadyEvent {
            fd: 7,
            readable: false,
            writable: false,
            error: true,
        });
        lp.poll_once(Some(Duration::ZERO));
        assert!(hit.get());
        assert_eq!(fake.lock().unwrap().registered_count(), 2);
    }

    #[test]
    fn real_loop_runs_posted_work_and_timers() {
        let (tx, rx) = std::sync::mpsc::channel::<LoopHandle>();
        let join = std::thread::Builder::new()
            .name("loop-test".into())
            .spawn(move || {
                let lp = EventLoop::new().unwrap();
                tx.send(lp.handle()).unwrap();
                lp.run();
            })
            .unwrap();
        let handle = rx.recv().unwrap();

        let task_ran = Arc::new(AtomicBool::new(false));
        let timer_ran = Arc::new(AtomicBool::new(false));
        {
            let flag = task_ran.clone();
            handle.post(move |_lp| flag.store(true, Ordering::SeqCst));
        }
        {
            let flag = timer_ran.clone();
            handle.schedule(Duration::from_millis(10), false, move || {
                flag.store(true, Ordering::SeqCst)
            });
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline
            && !(task_ran.load(Ordering::SeqCst) && timer_ran.load(Ordering::SeqCst))
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(task_ran.load(Ordering::SeqCst));
        assert!(timer_ran.load(Ordering::SeqCst));

        handle.stop();
        join.join().unwrap();
        assert!(!handle.is_running());
    }
}
