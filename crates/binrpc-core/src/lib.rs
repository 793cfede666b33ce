//! # binrpc-core: wire types and framing for the binrpc engine
//!
//! This crate is the leaf of the workspace: it knows nothing about
//! sockets or event loops. It provides the growable byte [`Buffer`]
//! that connections read into, the [`RpcMessage`] frame type, the
//! [`FrameCodec`] that maps between the two, and the shared error-code
//! table carried inside frames.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;

pub use buffer::Buffer;
pub use codec::{DecodeError, EncodeError, FrameCodec};
pub use config::RpcConfig;
pub use message::RpcMessage;
