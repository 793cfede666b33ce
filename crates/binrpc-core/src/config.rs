//! Engine configuration
//!
//! Plain struct, filled by the embedding application. There is no file
//! loading here; binaries parse whatever source they like and populate
//! this.

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Address the server listens on. Port 0 binds an ephemeral port.
    pub listen_addr: SocketAddr,
    /// Base IO-thread count before load-based adjustment.
    pub io_threads: usize,
    /// Initial size of each connection's read and write buffers.
    pub buffer_size: usize,
    /// Deadline for establishing a client connection.
    pub connect_timeout: Duration,
    /// Deadline for a full request/response exchange.
    pub call_timeout: Duration,
    /// Connect attempts per call beyond the first.
    pub max_retry: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            io_threads: 2,
            buffer_size: 128,
            connect_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(3),
            max_retry: 2,
        }
    }
}
