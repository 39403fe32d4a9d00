//! Address resolution and socket setup helpers shared by client and server.
//!
//! Grounded on the teacher's `utils/sockets.rs` (binding/resolving helpers,
//! returning plain `io::Result`s for the caller to log).

use std::io;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};

/// Resolves a `host:port` (or bare `port`, bound to `0.0.0.0`/`[::]`) string used for `-s`/`-c`
/// listen addresses, as accepted by spec §6.
pub async fn resolve_listen_addr(spec: &str) -> io::Result<SocketAddr> {
    if let Ok(port) = spec.parse::<u16>() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    resolve_one(spec).await
}

/// Resolves a `host:port` string to a single socket address, as used for `-t` and `-r`.
pub async fn resolve_host_port(spec: &str) -> io::Result<SocketAddr> {
    resolve_one(spec).await
}

async fn resolve_one(spec: &str) -> io::Result<SocketAddr> {
    let mut addrs = lookup_host(spec).await?;
    addrs
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("could not resolve \"{spec}\"")))
}

/// Resolves every address a `host:port` name maps to, used for the client's hello rounds
/// (spec §4.4 tries every resolved address of the configured peer).
pub async fn resolve_all(spec: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host(spec).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, format!("could not resolve \"{spec}\"")));
    }
    Ok(addrs)
}

pub async fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr).await
}

pub async fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

pub async fn connect_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bare_port_binds_wildcard() {
        let addr = resolve_listen_addr("0").await.unwrap();
        assert_eq!(addr.port(), 0);
        assert!(addr.ip().is_unspecified());
    }

    #[tokio::test]
    async fn host_port_resolves_loopback() {
        let addr = resolve_host_port("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }
}
