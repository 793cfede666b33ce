//! Service publication seam
//!
//! Registration announces each method to a [`ServicePublisher`]. The
//! default just logs; a real directory-service client would implement
//! the same trait.

use tracing::info;

use crate::error::RpcError;

pub trait ServicePublisher: Send + Sync {
    fn publish(&self, service: &str, method: &str, addr: &str) -> Result<(), RpcError>;
}

/// Publisher that records registrations in the log and nothing else.
pub struct LogPublisher;

impl ServicePublisher for LogPublisher {
    fn publish(&self, service: &str, method: &str, addr: &str) -> Result<(), RpcError> {
        info!(service, method, addr, "method published");
        Ok(())
    }
}
