//! Service and method definitions
//!
//! The dispatcher sees only opaque payload bytes; [`MethodDef::unary`]
//! layers typed request/response structs over that with bincode.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use binrpc_core::error::code;

/// Application-level outcome carried back in the frame's error fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcStatus {
    pub code: i32,
    pub info: String,
}

impl RpcStatus {
    pub fn new(code: i32, info: impl Into<String>) -> Self {
        RpcStatus {
            code,
            info: info.into(),
        }
    }
}

/// Completion callback a handler must invoke exactly once.
pub type Done = Box<dyn FnOnce(Result<Vec<u8>, RpcStatus>)>;

pub(crate) type MethodHandler = Arc<dyn Fn(&[u8], Done) + Send + Sync>;

/// One callable method: a name and a type-erased handler.
pub struct MethodDef {
    pub name: String,
    pub(crate) handler: MethodHandler,
}

impl MethodDef {
    /// Method over raw payload bytes.
    pub fn raw(
        name: impl Into<String>,
        f: impl Fn(&[u8]) -> Result<Vec<u8>, RpcStatus> + Send + Sync + 'static,
    ) -> Self {
        MethodDef {
            name: name.into(),
            handler: Arc::new(move |payload, done| done(f(payload))),
        }
    }

    /// Typed unary method: bincode in, bincode out. Codec failures map
    /// to the deserialize/serialize error codes.
    pub fn unary<Req, Rsp>(
        name: impl Into<String>,
        f: impl Fn(Req) -> Result<Rsp, RpcStatus> + Send + Sync + 'static,
    ) -> Self
    where
        Req: DeserializeOwned + 'static,
        Rsp: Serialize + 'static,
    {
        MethodDef {
            name: name.into(),
            handler: Arc::new(move |payload, done| {
                let req: Req =
                    match bincode::serde::decode_from_slice(payload, bincode::config::standard()) {
                        Ok((req, _)) => req,
                        Err(err) => {
                            return done(Err(RpcStatus::new(
                                code::DESERIALIZE_FAILED,
                                format!("deserialize error: {err}"),
                            )))
                        }
                    };
                match f(req) {
                    Ok(rsp) => {
                        match bincode::serde::encode_to_vec(&rsp, bincode::config::standard()) {
                            Ok(bytes) => done(Ok(bytes)),
                            Err(err) => done(Err(RpcStatus::new(
                                code::SERIALIZE_FAILED,
                                format!("serialize error: {err}"),
                            ))),
                        }
                    }
                    Err(status) => done(Err(status)),
                }
            }),
        }
    }
}

/// A named bundle of methods registerable with the dispatcher.
pub trait RpcService: Send + Sync {
    fn name(&self) -> &str;
    /// Method table in registration order.
    fn methods(&self) -> Vec<MethodDef>;
}
