//! Engine-level errors

use std::io;
use thiserror::Error;

use binrpc_core::codec::EncodeError;
use binrpc_net::NetError;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),

    #[error("bind to {addr} failed: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("connection is not open")]
    NotConnected,

    #[error("address resolution failed for {0:?}")]
    Resolve(String),

    #[error("service already registered: {0}")]
    DuplicateService(String),

    #[error("service publish failed: {0}")]
    Publish(String),
}
