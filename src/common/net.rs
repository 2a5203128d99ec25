//! Network utility functions
//!
//! This module provides utility functions for network operations.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use super::error::{ProxyError, Result};

/// Parse a socket address
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match addr.to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                Ok(addr)
            } else {
                Err(ProxyError::Network(format!("Failed to parse address: {}", addr)))
            }
        }
        Err(e) => Err(ProxyError::Network(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Join a host and a port into a resolvable `host:port` string
///
/// Bare IPv6 literals are bracketed so the result parses as a socket address.
pub fn join_host_port(host: &str, port: u16) -> String {
    match IpAddr::from_str(host) {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Resolve a bind address from a host and a port
pub fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    parse_socket_addr(&join_host_port(host, port))
}
