//! RPC frame payload type

/// Byte opening every frame on the wire.
pub const FRAME_START: u8 = 0x02;
/// Byte closing every frame on the wire.
pub const FRAME_END: u8 = 0x03;

/// One request or response frame.
///
/// The engine treats `payload` as opaque bytes; typed encoding lives in
/// the service layer. `err_code` zero means success, anything else is
/// one of the codes in [`crate::error::code`] and `err_info` carries a
/// human-readable description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcMessage {
    pub msg_id: String,
    pub method: String,
    pub err_code: i32,
    pub err_info: String,
    pub payload: Vec<u8>,
}

impl RpcMessage {
    pub fn request(msg_id: impl Into<String>, method: impl Into<String>, payload: Vec<u8>) -> Self {
        RpcMessage {
            msg_id: msg_id.into(),
            method: method.into(),
            err_code: 0,
            err_info: String::new(),
            payload,
        }
    }

    /// Response skeleton for a request: msg_id and method are copied
    /// before any dispatch decision so the caller can always correlate.
    pub fn response_for(request: &RpcMessage) -> Self {
        RpcMessage {
            msg_id: request.msg_id.clone(),
            method: request.method.clone(),
            err_code: 0,
            err_info: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn set_error(&mut self, code: i32, info: impl Into<String>) {
        self.err_code = code;
        self.err_info = info.into();
    }

    pub fn is_ok(&self) -> bool {
        self.err_code == 0
    }
}
