//! Non-blocking listen socket

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::error::RpcError;
use crate::sock;

const BACKLOG: i32 = 1024;

pub struct Acceptor {
    fd: OwnedFd,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Bind and listen. Port 0 picks an ephemeral port; the effective
    /// address is readable via [`local_addr`](Self::local_addr).
    pub fn bind(addr: SocketAddr) -> Result<Self, RpcError> {
        let fd = sock::nonblocking_tcp_socket(&addr).map_err(RpcError::Socket)?;
        sock::set_reuse(fd.as_raw_fd()).map_err(RpcError::Socket)?;
        sock::bind(fd.as_raw_fd(), &addr).map_err(|source| RpcError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        sock::listen(fd.as_raw_fd(), BACKLOG).map_err(RpcError::Listen)?;
        let local_addr = sock::local_addr(fd.as_raw_fd()).map_err(RpcError::Socket)?;
        debug!(%local_addr, "listening");
        Ok(Acceptor { fd, local_addr })
    }

    /// One accepted connection, or `None` when the queue is empty.
    pub fn accept(&self) -> std::io::Result<Option<(OwnedFd, SocketAddr)>> {
        sock::accept(self.fd.as_raw_fd())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port_and_accepts() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr();
        assert_ne!(addr.port(), 0);

        // Empty queue reads as None, not an error.
        assert!(acceptor.accept().unwrap().is_none());

        let client = std::net::TcpStream::connect(addr).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            accepted = acceptor.accept().unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (_fd, peer) = accepted.expect("connection queued");
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
