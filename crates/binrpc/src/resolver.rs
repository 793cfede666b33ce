//! Target address resolution seam

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait AddressResolver: Send + Sync {
    /// Map a target name to a socket address, `None` when unknown.
    fn resolve(&self, name: &str) -> Option<SocketAddr>;
}

/// Treats the target name itself as an `ip:port` literal.
pub struct StaticResolver;

impl AddressResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<SocketAddr> {
        name.parse().ok()
    }
}

/// Rotates through a fixed candidate list, ignoring the name.
pub struct RoundRobinResolver {
    candidates: Vec<SocketAddr>,
    next: AtomicUsize,
}

impl RoundRobinResolver {
    pub fn new(candidates: Vec<SocketAddr>) -> Self {
        RoundRobinResolver {
            candidates,
            next: AtomicUsize::new(0),
        }
    }
}

impl AddressResolver for RoundRobinResolver {
    fn resolve(&self, _name: &str) -> Option<SocketAddr> {
        if self.candidates.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.candidates.len();
        Some(self.candidates[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_parses_literals() {
        let r = StaticResolver;
        assert_eq!(
            r.resolve("127.0.0.1:8080"),
            Some("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(r.resolve("not-an-addr"), None);
    }

    #[test]
    fn round_robin_rotates_and_wraps() {
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:2".parse().unwrap();
        let r = RoundRobinResolver::new(vec![a, b]);
        assert_eq!(r.resolve("x"), Some(a));
        assert_eq!(r.resolve("x"), Some(b));
        assert_eq!(r.resolve("x"), Some(a));
    }

    #[test]
    fn round_robin_empty_is_none() {
        let r = RoundRobinResolver::new(Vec::new());
        assert_eq!(r.resolve("x"), None);
    }
}
