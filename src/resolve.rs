//! Address resolution
//!
//! Turns an endpoint's host/port into an ordered list of candidate socket
//! addresses. The listener treats this as a black box, so tests and embedders
//! can substitute their own [`Resolver`].

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Source of candidate addresses for an endpoint
pub trait Resolver {
    /// Resolve `host:port`. `None` means the wildcard address.
    fn resolve(&self, host: Option<&str>, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system resolver (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: Option<&str>, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = match host {
            None => vec![
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            ],
            Some(host) => (host, port).to_socket_addrs()?.collect(),
        };
        Ok(dedup_preserving_order(addrs))
    }
}

/// Resolver that always returns a fixed candidate list, ignoring the request
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addrs: Vec<SocketAddr>,
}

impl StaticResolver {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        StaticResolver { addrs }
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, _host: Option<&str>, _port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(self.addrs.clone())
    }
}

fn dedup_preserving_order(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut out: Vec<SocketAddr> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}
