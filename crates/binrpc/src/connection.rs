//! TCP connection state machine
//!
//! A `Connection` lives on exactly one loop thread inside an
//! `Rc<RefCell<_>>`. Its fd callbacks hold strong clones of that `Rc`;
//! [`Connection::clear`] breaks the cycle by dropping the callbacks, so
//! teardown happens exactly once and the memory follows.
//!
//! Cross-thread observers (the server's sweep timer) see only the
//! [`ConnStateHandle`], an atomic mirror of the state field.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use binrpc_core::{Buffer, FrameCodec, RpcMessage};
use binrpc_net::{EventLoop, FdEvent, Interest, LoopHandle};
use tracing::{debug, error, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::sock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    NotConnected = 0,
    Connected = 1,
    HalfClosing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            1 => ConnState::Connected,
            2 => ConnState::HalfClosing,
            3 => ConnState::Closed,
            _ => ConnState::NotConnected,
        }
    }
}

/// Cross-thread view of a connection's state.
#[derive(Clone)]
pub struct ConnStateHandle(Arc<AtomicU8>);

impl ConnStateHandle {
    pub fn new() -> Self {
        ConnStateHandle(Arc::new(AtomicU8::new(ConnState::NotConnected as u8)))
    }

    pub fn get(&self) -> ConnState {
        ConnState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.get() == ConnState::Closed
    }

    fn set(&self, state: ConnState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for ConnStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Send-safe teardown token for a connection owned by a loop thread.
///
/// Holds no reference to the connection itself: the posted task finds
/// it through the loop's fd table, and the state check runs on the
/// loop thread, so a connection that already closed (whose fd number
/// may have been reused) is left alone.
#[derive(Clone)]
pub struct ConnCloseHandle {
    lp: LoopHandle,
    fd: RawFd,
    state: ConnStateHandle,
}

impl ConnCloseHandle {
    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    /// Post a teardown to the owning loop.
    pub fn close(&self) {
        let fd = self.fd;
        let state = self.state.clone();
        self.lp.post(move |lp| {
            if state.is_closed() {
                return;
            }
            if let Some(event) = lp.event_for(fd) {
                event.fire_error();
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnRole {
    Server,
    Client,
}

/// Runs when a queued client message has been handed to the kernel.
pub type WriteDone = Box<dyn FnOnce(&RpcMessage)>;
/// Runs when the response matching a msg_id arrives.
pub type ReadDone = Box<dyn FnOnce(RpcMessage)>;

pub struct Connection {
    fd: OwnedFd,
    role: ConnRole,
    state: ConnState,
    state_handle: ConnStateHandle,
    event: Rc<FdEvent>,
    lp: EventLoop,
    codec: FrameCodec,
    in_buf: Buffer,
    out_buf: Buffer,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
    dispatcher: Option<Arc<Dispatcher>>,
    pending_writes: Vec<(RpcMessage, Option<WriteDone>)>,
    read_dones: HashMap<String, ReadDone>,
}

impl Connection {
    /// Server-side connection over an accepted fd: immediately
    /// Connected and listening for requests.
    pub fn new_server(
        lp: &EventLoop,
        fd: OwnedFd,
        peer_addr: SocketAddr,
        buffer_size: usize,
        dispatcher: Arc<Dispatcher>,
        state_handle: ConnStateHandle,
    ) -> Result<Rc<RefCell<Connection>>, RpcError> {
        let conn = Self::build(
            lp,
            fd,
            peer_addr,
            buffer_size,
            ConnRole::Server,
            Some(dispatcher),
            state_handle,
        );
        {
            let mut c = conn.borrow_mut();
            c.state = ConnState::Connected;
            c.state_handle.set(ConnState::Connected);
            c.local_addr = sock::local_addr(c.fd.as_raw_fd()).ok();
        }
        Self::install_io_callbacks(&conn);
        let armed = conn.borrow_mut().arm_read();
        if let Err(err) = armed {
            Connection::clear(&conn);
            return Err(err);
        }
        debug!(peer = %peer_addr, "server connection established");
        Ok(conn)
    }

    /// Client-side connection over a fresh socket: stays NotConnected
    /// until the connect attempt resolves.
    pub fn new_client(
        lp: &EventLoop,
        fd: OwnedFd,
        peer_addr: SocketAddr,
        buffer_size: usize,
    ) -> Rc<RefCell<Connection>> {
        let conn = Self::build(
            lp,
            fd,
            peer_addr,
            buffer_size,
            ConnRole::Client,
            None,
            ConnStateHandle::new(),
        );
        Self::install_io_callbacks(&conn);
        conn
    }

    fn build(
        lp: &EventLoop,
        fd: OwnedFd,
        peer_addr: SocketAddr,
        buffer_size: usize,
        role: ConnRole,
        dispatcher: Option<Arc<Dispatcher>>,
        state_handle: ConnStateHandle,
    ) -> Rc<RefCell<Connection>> {
        if let Err(err) = sock::set_nonblocking(fd.as_raw_fd()) {
            warn!(%err, "set_nonblocking failed");
        }
        // Not every transport supports it (unix sockets in tests).
        if let Err(err) = sock::set_nodelay(fd.as_raw_fd()) {
            debug!(%err, "TCP_NODELAY not applied");
        }
        let event = FdEvent::new(fd.as_raw_fd());
        Rc::new(RefCell::new(Connection {
            fd,
            role,
            state: ConnState::NotConnected,
            state_handle,
            event,
            lp: lp.clone(),
            codec: FrameCodec::new(),
            in_buf: Buffer::new(buffer_size),
            out_buf: Buffer::new(buffer_size),
            local_addr: None,
            peer_addr,
            dispatcher,
            pending_writes: Vec::new(),
            read_dones: HashMap::new(),
        }))
    }

    /// (Re)point the fd callbacks at the normal read/write/error
    /// handlers. The client's connect resolver replaces the write
    /// callback temporarily and restores it through here.
    pub(crate) fn install_io_callbacks(conn: &Rc<RefCell<Connection>>) {
        let event = conn.borrow().event.clone();
        event.set_read({
            let conn = conn.clone();
            move || Connection::on_read(&conn)
        });
        event.set_write({
            let conn = conn.clone();
            move || Connection::on_write(&conn)
        });
        event.set_error({
            let conn = conn.clone();
            move || Connection::on_error(&conn)
        });
    }

    fn on_read(conn: &Rc<RefCell<Connection>>) {
        let mut closed = false;
        {
            let mut c = conn.borrow_mut();
            if c.state != ConnState::Connected {
                warn!(state = ?c.state, "read event on inactive connection");
                return;
            }
            let fd = c.fd.as_raw_fd();
            loop {
                if c.in_buf.writable() == 0 {
                    let grow_to = c.in_buf.capacity().max(64);
                    c.in_buf.ensure_writable(grow_to);
                }
                let (ptr, want) = {
                    let slot = c.in_buf.write_slot();
                    (slot.as_mut_ptr(), slot.len())
                };
                let n = unsafe { libc::read(fd, ptr.cast(), want) };
                if n > 0 {
                    let n = n as usize;
                    c.in_buf.advance_write(n);
                    if n < want {
                        break;
                    }
                } else if n == 0 {
                    debug!(peer = %c.peer_addr, "peer closed");
                    closed = true;
                    break;
                } else {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => break,
                        Some(libc::EINTR) => continue,
                        _ => {
                            error!(fd, %err, peer = %c.peer_addr, "read failed");
                            closed = true;
                            break;
                        }
                    }
                }
            }
        }
        if closed {
            // Undecoded inbound bytes die with the connection.
            Connection::clear(conn);
            return;
        }
        Connection::process_frames(conn);
    }

    /// Decode everything complete in the inbound buffer and route it
    /// by role.
    fn process_frames(conn: &Rc<RefCell<Connection>>) {
        let (role, messages) = {
            let mut c = conn.borrow_mut();
            let codec = c.codec;
            let (messages, errors) = codec.decode(&mut c.in_buf);
            for err in &errors {
                error!(%err, peer = %c.peer_addr, "frame decode error");
            }
            (c.role, messages)
        };

        match role {
            ConnRole::Server => {
                let dispatcher = conn.borrow().dispatcher.clone();
                let Some(dispatcher) = dispatcher else {
                    error!("server connection without a dispatcher");
                    return;
                };
                for msg in messages {
                    trace!(msg_id = %msg.msg_id, method = %msg.method, "request in");
                    let reply_conn = conn.clone();
                    dispatcher.dispatch(&msg, move |response| {
                        let result = reply_conn.borrow_mut().reply(vec![response]);
                        if let Err(err) = result {
                            error!(%err, "reply failed");
                        }
                    });
                }
            }
            ConnRole::Client => {
                for msg in messages {
                    let done = conn.borrow_mut().read_dones.remove(&msg.msg_id);
                    match done {
                        Some(done) => done(msg),
                        None => {
                            warn!(msg_id = %msg.msg_id, "response with no waiter")
                        }
                    }
                }
            }
        }
    }

    fn on_write(conn: &Rc<RefCell<Connection>>) {
        let mut closed = false;
        let mut completed: Vec<(RpcMessage, Option<WriteDone>)> = Vec::new();
        {
            let mut c = conn.borrow_mut();
            if c.state != ConnState::Connected {
                warn!(state = ?c.state, "write event on inactive connection");
                return;
            }

            // Client role folds its queued messages in first.
            if c.role == ConnRole::Client && !c.pending_writes.is_empty() {
                let queued: Vec<RpcMessage> =
                    c.pending_writes.iter().map(|(m, _)| m.clone()).collect();
                let codec = c.codec;
                if let Err(err) = codec.encode(&queued, &mut c.out_buf) {
                    error!(%err, "encode of queued messages failed");
                }
                completed = std::mem::take(&mut c.pending_writes);
            }

            let fd = c.fd.as_raw_fd();
            loop {
                if c.out_buf.readable() == 0 {
                    let mut interest = c.event.interest();
                    interest.writable = false;
                    c.event.set_interest(interest);
                    if let Err(err) = c.lp.add_event(&c.event) {
                        warn!(%err, "disarming write interest failed");
                    }
                    break;
                }
                let (ptr, len) = {
                    let s = c.out_buf.as_slice();
                    (s.as_ptr(), s.len())
                };
                let n = unsafe { libc::write(fd, ptr.cast(), len) };
                if n > 0 {
                    c.out_buf.retrieve(n as usize);
                    continue;
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        error!(fd, %err, peer = %c.peer_addr, "write failed");
                        closed = true;
                        break;
                    }
                }
            }
        }
        for (msg, done) in completed {
            if let Some(done) = done {
                done(&msg);
            }
        }
        if closed {
            Connection::clear(conn);
        }
    }

    fn on_error(conn: &Rc<RefCell<Connection>>) {
        {
            let c = conn.borrow();
            warn!(peer = %c.peer_addr, state = ?c.state, "connection error event");
        }
        Connection::clear(conn);
    }

    /// Encode `messages` into the outbound buffer and arm writability.
    pub fn reply(&mut self, messages: Vec<RpcMessage>) -> Result<(), RpcError> {
        if self.state != ConnState::Connected {
            return Err(RpcError::NotConnected);
        }
        self.codec.encode(&messages, &mut self.out_buf)?;
        self.arm_write()
    }

    /// Queue a client message; encoded when writability fires.
    pub(crate) fn push_send(&mut self, msg: RpcMessage, done: Option<WriteDone>) {
        self.pending_writes.push((msg, done));
    }

    /// Register a waiter for the response with this msg_id.
    pub(crate) fn push_read(&mut self, msg_id: String, done: ReadDone) {
        if self.read_dones.insert(msg_id.clone(), done).is_some() {
            warn!(%msg_id, "replaced existing waiter for msg_id");
        }
    }

    pub(crate) fn arm_read(&mut self) -> Result<(), RpcError> {
        let mut interest = self.event.interest();
        interest.readable = true;
        self.event.set_interest(interest);
        self.lp.add_event(&self.event)?;
        Ok(())
    }

    pub(crate) fn arm_write(&mut self) -> Result<(), RpcError> {
        let mut interest = self.event.interest();
        interest.writable = true;
        self.event.set_interest(interest);
        self.lp.add_event(&self.event)?;
        Ok(())
    }

    /// Graceful close: stop both directions and wait for the peer's
    /// FIN to drive the read path into [`clear`](Self::clear).
    pub fn shutdown(&mut self) {
        if matches!(self.state, ConnState::Closed | ConnState::NotConnected) {
            return;
        }
        self.state = ConnState::HalfClosing;
        self.state_handle.set(ConnState::HalfClosing);
        if let Err(err) = sock::shutdown_both(self.fd.as_raw_fd()) {
            warn!(%err, "shutdown failed");
        }
    }

    /// Idempotent teardown: deregister, mark Closed, drop callbacks
    /// and queued client work.
    pub fn clear(conn: &Rc<RefCell<Connection>>) {
        let (event, waiters, queued) = {
            let mut c = conn.borrow_mut();
            if c.state == ConnState::Closed {
                return;
            }
            c.event.set_interest(Interest::none());
            c.lp.remove_event(&c.event);
            c.state = ConnState::Closed;
            c.state_handle.set(ConnState::Closed);
            debug!(peer = %c.peer_addr, "connection closed");
            (
                c.event.clone(),
                std::mem::take(&mut c.read_dones),
                std::mem::take(&mut c.pending_writes),
            )
        };
        // Outside the borrow: the callbacks, waiters and queued writes
        // may hold the last strong references to the connection itself.
        event.clear_callbacks();
        drop(waiters);
        drop(queued);
    }

    pub(crate) fn mark_connected(&mut self) {
        self.state = ConnState::Connected;
        self.state_handle.set(ConnState::Connected);
        self.local_addr = sock::local_addr(self.fd.as_raw_fd()).ok();
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn state_handle(&self) -> ConnStateHandle {
        self.state_handle.clone()
    }

    pub fn close_handle(&self) -> ConnCloseHandle {
        ConnCloseHandle {
            lp: self.lp.handle(),
            fd: self.fd.as_raw_fd(),
            state: self.state_handle.clone(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn event(&self) -> Rc<FdEvent> {
        self.event.clone()
    }

    pub(crate) fn raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn loop_ref(&self) -> EventLoop {
        self.lp.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LogPublisher;
    use binrpc_net::IoThread;
    use std::time::{Duration, Instant};

    fn test_dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(Arc::new(LogPublisher)))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn clear_is_idempotent() {
        let lp = EventLoop::new().unwrap();
        let (a, _b) = sock::socketpair_stream().unwrap();
        let handle = ConnStateHandle::new();
        let conn = Connection::new_server(
            &lp,
            a,
            "127.0.0.1:1".parse().unwrap(),
            128,
            test_dispatcher(),
            handle.clone(),
        )
        .unwrap();

        assert_eq!(handle.get(), ConnState::Connected);
        Connection::clear(&conn);
        assert_eq!(handle.get(), ConnState::Closed);
        // Second clear must be a no-op, not a double teardown.
        Connection::clear(&conn);
        assert_eq!(handle.get(), ConnState::Closed);
        assert_eq!(conn.borrow().state(), ConnState::Closed);
    }

    #[test]
    fn eof_drives_connection_to_closed() {
        let t = IoThread::start("conn-eof-test").unwrap();
        let (a, b) = sock::socketpair_stream().unwrap();
        let handle = ConnStateHandle::new();

        let dispatcher = test_dispatcher();
        let h2 = handle.clone();
        t.handle().post(move |lp| {
            Connection::new_server(lp, a, "127.0.0.1:1".parse().unwrap(), 128, dispatcher, h2)
                .expect("connection setup");
            // The local Rc drops here; io callbacks keep it alive.
        });
        assert!(wait_for(|| handle.get() == ConnState::Connected));

        drop(b);
        assert!(wait_for(|| handle.get() == ConnState::Closed));
        t.stop();
    }

    #[test]
    fn close_handle_tears_down_from_another_thread() {
        let t = IoThread::start("conn-close-handle-test").unwrap();
        let (a, _b) = sock::socketpair_stream().unwrap();
        let handle = ConnStateHandle::new();

        let dispatcher = test_dispatcher();
        let h2 = handle.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        t.handle().post(move |lp| {
            let conn =
                Connection::new_server(lp, a, "127.0.0.1:1".parse().unwrap(), 128, dispatcher, h2)
                    .expect("connection setup");
            let _ = tx.send(conn.borrow().close_handle());
        });
        let close = rx.recv_timeout(Duration::from_secs(2)).expect("close handle");
        assert!(wait_for(|| handle.get() == ConnState::Connected));

        close.close();
        assert!(wait_for(|| handle.get() == ConnState::Closed));
        // A second close on an already-closed connection is a no-op.
        close.close();
        t.stop();
    }

    #[test]
    fn shutdown_from_not_connected_is_a_noop() {
        let lp = EventLoop::new().unwrap();
        let (a, _b) = sock::socketpair_stream().unwrap();
        let conn = Connection::new_client(&lp, a, "127.0.0.1:1".parse().unwrap(), 128);
        conn.borrow_mut().shutdown();
        assert_eq!(conn.borrow().state(), ConnState::NotConnected);
    }
}
