//! Non-blocking RPC client endpoint
//!
//! Built and used on its owning loop thread, with that loop running;
//! connect resolution and IO all happen as loop callbacks, never by
//! pumping the loop inline.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use binrpc_core::RpcMessage;
use binrpc_net::EventLoop;
use tracing::{debug, warn};

use crate::connection::{ConnCloseHandle, ConnState, ConnStateHandle, Connection, ReadDone, WriteDone};
use crate::error::RpcError;
use crate::sock;

pub struct TcpClient {
    conn: Rc<RefCell<Connection>>,
    peer_addr: SocketAddr,
}

impl TcpClient {
    pub fn new(lp: &EventLoop, peer_addr: SocketAddr, buffer_size: usize) -> Result<Self, RpcError> {
        let fd = sock::nonblocking_tcp_socket(&peer_addr).map_err(RpcError::Socket)?;
        let conn = Connection::new_client(lp, fd, peer_addr, buffer_size);
        Ok(TcpClient { conn, peer_addr })
    }

    /// Start connecting. `done` fires exactly once, on this loop
    /// thread: immediately on instant success or failure, or from the
    /// writability callback once a pending connect resolves.
    pub fn connect(&self, done: impl FnOnce(Result<(), RpcError>) + 'static) {
        let fd = self.conn.borrow().raw_fd();
        let peer = self.peer_addr;
        match sock::connect(fd, &peer) {
            Ok(()) => {
                debug!(%peer, "connected immediately");
                self.conn.borrow_mut().mark_connected();
                let armed = self.conn.borrow_mut().arm_read();
                if armed.is_err() {
                    Connection::clear(&self.conn);
                }
                done(armed);
            }
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.resolve_later(done);
            }
            Err(err) => {
                warn!(%err, %peer, "connect failed");
                Connection::clear(&self.conn);
                done(Err(RpcError::Connect {
                    addr: peer.to_string(),
                    source: err,
                }));
            }
        }
    }

    /// Pending connect: take over the write callback until the socket
    /// turns writable, then read the verdict from SO_ERROR.
    fn resolve_later(&self, done: impl FnOnce(Result<(), RpcError>) + 'static) {
        let conn = self.conn.clone();
        let event = self.conn.borrow().event();
        // The fd callback is a Fn; this gate makes `done` single-shot.
        let slot = Rc::new(RefCell::new(Some(done)));

        event.set_write({
            let conn = conn.clone();
            let slot = slot.clone();
            move || {
                let Some(done) = slot.borrow_mut().take() else {
                    return;
                };
                done(Self::resolve_pending_connect(&conn));
            }
        });

        let armed = self.conn.borrow_mut().arm_write();
        if let Err(err) = armed {
            Connection::clear(&conn);
            if let Some(done) = slot.borrow_mut().take() {
                done(Err(err));
            }
        }
    }

    fn resolve_pending_connect(conn: &Rc<RefCell<Connection>>) -> Result<(), RpcError> {
        let (fd, peer) = {
            let c = conn.borrow();
            (c.raw_fd(), c.peer_addr())
        };
        let verdict = match sock::socket_error(fd) {
            Ok(v) => v,
            Err(source) => {
                Connection::clear(conn);
                return Err(RpcError::Connect {
                    addr: peer.to_string(),
                    source,
                });
            }
        };
        if verdict != 0 {
            let source = io::Error::from_raw_os_error(verdict);
            warn!(err = %source, %peer, "pending connect failed");
            Connection::clear(conn);
            return Err(RpcError::Connect {
                addr: peer.to_string(),
                source,
            });
        }

        debug!(%peer, "pending connect resolved");
        let armed = {
            let mut c = conn.borrow_mut();
            c.mark_connected();
            let event = c.event();
            let mut interest = event.interest();
            interest.writable = false;
            event.set_interest(interest);
            c.arm_read()
        };
        if let Err(err) = armed {
            Connection::clear(conn);
            return Err(err);
        }
        // Put the normal write handler back in place of the resolver.
        Connection::install_io_callbacks(conn);
        Ok(())
    }

    /// Queue a message; `done` fires after its bytes reach the kernel.
    pub fn write_message(
        &self,
        msg: RpcMessage,
        done: Option<WriteDone>,
    ) -> Result<(), RpcError> {
        let mut c = self.conn.borrow_mut();
        if c.state() != ConnState::Connected {
            return Err(RpcError::NotConnected);
        }
        c.push_send(msg, done);
        c.arm_write()
    }

    /// Wait for the response carrying `msg_id`.
    pub fn read_message(&self, msg_id: String, done: ReadDone) -> Result<(), RpcError> {
        let mut c = self.conn.borrow_mut();
        if c.state() != ConnState::Connected {
            return Err(RpcError::NotConnected);
        }
        c.push_read(msg_id, done);
        c.arm_read()
    }

    pub fn shutdown(&self) {
        self.conn.borrow_mut().shutdown();
    }

    pub fn close(&self) {
        Connection::clear(&self.conn);
    }

    pub fn state(&self) -> ConnState {
        self.conn.borrow().state()
    }

    pub fn state_handle(&self) -> ConnStateHandle {
        self.conn.borrow().state_handle()
    }

    /// Send-safe token that can tear this connection down from another
    /// thread, via the owning loop.
    pub fn close_handle(&self) -> ConnCloseHandle {
        self.conn.borrow().close_handle()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.borrow().local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrpc_net::IoThread;
    use std::sync::mpsc;
    use std::time::Duration;

    fn connect_from_loop(addr: SocketAddr) -> Result<(), String> {
        let t = IoThread::start("client-connect-test").unwrap();
        let (tx, rx) = mpsc::channel::<Result<(), String>>();
        t.handle().post(move |lp| {
            let client = match TcpClient::new(lp, addr, 128) {
                Ok(c) => c,
                Err(err) => {
                    let _ = tx.send(Err(err.to_string()));
                    return;
                }
            };
            client.connect(move |result| {
                let _ = tx.send(result.map_err(|e| e.to_string()));
            });
        });
        let result = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("connect outcome");
        t.stop();
        result
    }

    #[test]
    fn connects_to_listening_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(connect_from_loop(addr), Ok(()));
    }

    #[test]
    fn reports_connection_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect_from_loop(addr);
        assert!(result.is_err(), "expected refusal, got {result:?}");
    }

    #[test]
    fn failed_connect_closes_and_frees_the_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let t = IoThread::start("client-teardown-test").unwrap();
        let (tx, rx) = mpsc::channel();
        t.handle().post(move |lp| {
            let client = TcpClient::new(lp, addr, 128).unwrap();
            let state = client.state_handle();
            let fd = client.conn.borrow().raw_fd();
            client.connect(move |result| {
                let _ = tx.send((result.is_err(), state.get(), fd));
            });
        });
        let (failed, state, fd) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("connect outcome");
        assert!(failed);
        assert_eq!(state, ConnState::Closed);

        // With the callbacks and queues dropped nothing keeps the
        // connection alive; the fd closes once the loop lets go.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
        t.stop();
    }
}
