//
// port_picker.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6, TcpListener, ToSocketAddrs};

// Try to bind to a socket using TCP
fn test_bind_tcp<A: ToSocketAddrs>(addr: A) -> Option<u16> {
    Some(TcpListener::bind(addr).ok()?.local_addr().ok()?.port())
}

/// Asks the OS for a free port by binding to port 0 (IPv6 first, then IPv4).
fn ask_free_tcp_port() -> Option<u16> {
    let ipv4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    let ipv6 = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0);

    test_bind_tcp(ipv6).or_else(|| test_bind_tcp(ipv4))
}

/// Picks an available TCP port.
///
/// The port is confirmed bindable at the time of the call, but is released
/// again before returning; callers that need the port should bind it promptly.
pub fn pick_unused_tcp_port() -> Option<u16> {
    // Try up to 5 times to find a free port
    for _ in 0..5 {
        if let Some(port) = ask_free_tcp_port() {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_unused_tcp_port() {
        let port = pick_unused_tcp_port().expect("no free TCP port available");
        assert!(port > 0);
    }
}
