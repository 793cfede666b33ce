//! Error codes carried inside frames
//!
//! These values travel on the wire in the `err_code` field, so they are
//! stable i32 constants rather than an enum.

pub mod code {
    /// Method name could not be split into `Service.Method`.
    pub const PARSE_SERVICE_NAME: i32 = 10001;
    /// No service registered under the requested name.
    pub const SERVICE_NOT_FOUND: i32 = 10002;
    /// Service exists but has no such method.
    pub const METHOD_NOT_FOUND: i32 = 10003;
    /// Request payload failed to deserialize.
    pub const DESERIALIZE_FAILED: i32 = 10004;
    /// Response payload failed to serialize.
    pub const SERIALIZE_FAILED: i32 = 10005;
    /// Peer closed the connection mid-call.
    pub const PEER_CLOSED: i32 = 10006;
    /// TCP connect failed.
    pub const FAILED_CONNECT: i32 = 10007;
    /// Call deadline expired before a response arrived.
    pub const CALL_TIMEOUT: i32 = 10008;
}
