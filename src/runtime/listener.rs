//! Listening socket setup.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};

/// Wildcard address for `port`. IPv6 sockets are bound dual-stack.
pub fn any_addr(port: u16, ipv6: bool) -> SocketAddr {
    if ipv6 {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)
    } else {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)
    }
}

/// Create a blocking TCP listener bound to `addr`.
///
/// Sets `SO_REUSEADDR` so a restarted server can rebind while old
/// connections sit in TIME_WAIT, and clears `IPV6_V6ONLY` so an IPv6
/// listener also accepts IPv4-mapped peers.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
