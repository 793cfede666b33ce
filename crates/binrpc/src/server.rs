//! Accepting RPC server
//!
//! The main loop owns the acceptor; accepted fds are posted to an IO
//! thread picked round-robin, where the connection is built and lives.
//! The main loop also runs a periodic sweep that forgets connections
//! whose state handle has gone Closed.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use binrpc_core::RpcConfig;
use binrpc_net::{EventLoop, FdEvent, Interest, IoThreadGroup, LoopHandle};
use tracing::{debug, error, info, trace};

use crate::acceptor::Acceptor;
use crate::connection::{ConnStateHandle, Connection};
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct TcpServer {
    main_loop: EventLoop,
    io_group: Arc<IoThreadGroup>,
    conns: Arc<Mutex<Vec<ConnStateHandle>>>,
    local_addr: SocketAddr,
    // Held so the listen registration outlives construction.
    _acceptor: Rc<Acceptor>,
    _listen_event: Rc<FdEvent>,
}

/// Send half of a server: enough to stop it from another thread.
#[derive(Clone)]
pub struct ServerControl {
    main: LoopHandle,
    io_group: Arc<IoThreadGroup>,
}

impl ServerControl {
    /// Stop the main loop, then stop and join every IO thread.
    pub fn stop(&self) {
        self.main.stop();
        self.io_group.stop();
    }
}

impl TcpServer {
    pub fn new(config: &RpcConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, RpcError> {
        let main_loop = EventLoop::new()?;
        let io_group = Arc::new(IoThreadGroup::new(config.io_threads)?);
        let acceptor = Rc::new(Acceptor::bind(config.listen_addr)?);
        let local_addr = acceptor.local_addr();
        let conns: Arc<Mutex<Vec<ConnStateHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let listen_event = FdEvent::new(acceptor.raw_fd());
        listen_event.set_interest(Interest::read());
        listen_event.set_read({
            let acceptor = acceptor.clone();
            let io_group = io_group.clone();
            let dispatcher = dispatcher.clone();
            let conns = conns.clone();
            let buffer_size = config.buffer_size;
            move || {
                Self::on_accept(&acceptor, &io_group, &dispatcher, &conns, buffer_size)
            }
        });
        main_loop.add_event(&listen_event)?;

        // Periodic sweep of connections the IO threads have closed.
        {
            let conns = conns.clone();
            main_loop
                .handle()
                .schedule(SWEEP_INTERVAL, true, move || {
                    let mut list = conns.lock().unwrap_or_else(|e| e.into_inner());
                    let before = list.len();
                    list.retain(|h| !h.is_closed());
                    if list.len() < before {
                        trace!(removed = before - list.len(), "swept closed connections");
                    }
                });
        }

        info!(%local_addr, io_threads = io_group.len(), "server ready");
        Ok(TcpServer {
            main_loop,
            io_group,
            conns,
            local_addr,
            _acceptor: acceptor,
            _listen_event: listen_event,
        })
    }

    fn on_accept(
        acceptor: &Acceptor,
        io_group: &IoThreadGroup,
        dispatcher: &Arc<Dispatcher>,
        conns: &Arc<Mutex<Vec<ConnStateHandle>>>,
        buffer_size: usize,
    ) {
        loop {
            match acceptor.accept() {
                Ok(Some((fd, peer))) => {
                    debug!(%peer, "accepted connection");
                    let state = ConnStateHandle::new();
                    conns
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(state.clone());

                    let dispatcher = dispatcher.clone();
                    io_group.next().post(move |lp| {
                        if let Err(err) = Connection::new_server(
                            lp,
                            fd,
                            peer,
                            buffer_size,
                            dispatcher,
                            state,
                        ) {
                            error!(%err, %peer, "connection setup failed");
                        }
                    });
                }
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Run the main loop. Blocks until [`ServerControl::stop`] (or
    /// [`handle`](Self::handle)`.stop()`) is called.
    pub fn start(&self) {
        self.main_loop.run();
    }

    pub fn control(&self) -> ServerControl {
        ServerControl {
            main: self.main_loop.handle(),
            io_group: self.io_group.clone(),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.main_loop.handle()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently tracked, closed-but-unswept included.
    pub fn connection_count(&self) -> usize {
        self.conns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
