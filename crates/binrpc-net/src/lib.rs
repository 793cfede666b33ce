//! # binrpc-net: reactor layer for the binrpc engine
//!
//! One event loop per OS thread, epoll underneath, timerfd for timers
//! and an eventfd for cross-thread wakeup. Nothing here knows about RPC
//! frames; the crate hands out fd readiness and posted-task execution.
//!
//! Threading model:
//! - [`EventLoop`] and its fd registrations live on exactly one thread.
//! - [`LoopHandle`] is the only cross-thread surface: post tasks,
//!   schedule timers, stop the loop.

pub mod error;
pub mod event_loop;
pub mod io_thread;
pub mod poller;
pub mod timer;
pub mod wakeup;

mod sys;

pub use error::NetError;
pub use event_loop::{EventLoop, FdEvent, LoopHandle, Task};
pub use io_thread::{IoThread, IoThreadGroup};
#[cfg(target_os = "linux")]
pub use poller::EpollPoller;
pub use poller::{FakePoller, Interest, Poller, ReadyEvent};
pub use timer::{TimerHandle, TimerHeap};
