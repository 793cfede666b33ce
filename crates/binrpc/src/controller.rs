//! Per-call state shared between caller, loop and timeout timer

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct CtrlInner {
    msg_id: String,
    err_code: i32,
    err_info: String,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// Call-scoped state: identity, outcome, deadline and the
/// finished/cancelled flags that arbitrate response against timeout.
pub struct RpcController {
    inner: Mutex<CtrlInner>,
    timeout: Duration,
    max_retry: u32,
    finished: AtomicBool,
    cancelled: AtomicBool,
}

impl RpcController {
    pub fn new(timeout: Duration, max_retry: u32) -> Self {
        RpcController {
            inner: Mutex::new(CtrlInner::default()),
            timeout,
            max_retry,
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Claim completion. Only the first caller gets `true`; the loser
    /// of a response/timeout race must stand down.
    pub fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn set_msg_id(&self, msg_id: impl Into<String>) {
        self.lock().msg_id = msg_id.into();
    }

    pub fn msg_id(&self) -> String {
        self.lock().msg_id.clone()
    }

    pub fn set_error(&self, code: i32, info: impl Into<String>) {
        let mut inner = self.lock();
        inner.err_code = code;
        inner.err_info = info.into();
    }

    pub fn err_code(&self) -> i32 {
        self.lock().err_code
    }

    pub fn err_info(&self) -> String {
        self.lock().err_info.clone()
    }

    pub fn set_local_addr(&self, addr: Option<SocketAddr>) {
        self.lock().local_addr = addr;
    }

    pub fn set_peer_addr(&self, addr: Option<SocketAddr>) {
        self.lock().peer_addr = addr;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CtrlInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_finish_wins() {
        let ctrl = RpcController::new(Duration::from_secs(1), 0);
        assert!(ctrl.finish());
        assert!(!ctrl.finish());
        assert!(ctrl.is_finished());
    }

    #[test]
    fn error_fields_round_trip() {
        let ctrl = RpcController::new(Duration::from_secs(1), 2);
        ctrl.set_msg_id("m-1");
        ctrl.set_error(10008, "call timeout");
        assert_eq!(ctrl.msg_id(), "m-1");
        assert_eq!(ctrl.err_code(), 10008);
        assert_eq!(ctrl.err_info(), "call timeout");
        assert_eq!(ctrl.max_retry(), 2);
    }
}
