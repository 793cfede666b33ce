//! # binrpc: reactor-based TCP RPC engine
//!
//! Orchestration layer over `binrpc-core` (framing) and `binrpc-net`
//! (event loops): the connection state machine, the accepting server,
//! the non-blocking client, service dispatch and the call channel.
//!
//! A server wires an [`Acceptor`] to a main loop and fans accepted
//! connections out to an IO thread group; each connection decodes
//! frames and hands requests to the [`Dispatcher`]. A client posts its
//! entire call sequence onto one loop through an [`RpcChannel`].

pub mod acceptor;
pub mod channel;
pub mod client;
pub mod connection;
pub mod controller;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod resolver;
pub mod server;
pub mod service;

mod sock;

pub use acceptor::Acceptor;
pub use channel::RpcChannel;
pub use client::TcpClient;
pub use connection::{ConnCloseHandle, ConnState, ConnStateHandle, Connection};
pub use controller::RpcController;
pub use discovery::{LogPublisher, ServicePublisher};
pub use dispatcher::Dispatcher;
pub use error::RpcError;
pub use resolver::{AddressResolver, RoundRobinResolver, StaticResolver};
pub use server::{ServerControl, TcpServer};
pub use service::{MethodDef, RpcService, RpcStatus};

pub use binrpc_core::{error::code, Buffer, FrameCodec, RpcConfig, RpcMessage};
