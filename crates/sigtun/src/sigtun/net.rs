use std::{borrow::Cow, io, net::SocketAddr};

use tokio::net::TcpStream;

use crate::sigtun::tunnel::protocol::NetworkType;

/// Normalize a bind/listen address.
///
/// Configs may use the shorthand `":PORT"` for "all interfaces"; Tokio's bind
/// APIs do not accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Picks the tunnel network type for a resolved or unresolved destination.
pub fn network_for_host(host: &str) -> NetworkType {
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(_)) => NetworkType::Tcp4,
        Ok(std::net::IpAddr::V6(_)) => NetworkType::Tcp6,
        Err(_) => NetworkType::Tcp,
    }
}

/// Dials `addr` restricted to the address family of `network`.
///
/// Candidates are tried in resolver order; the last error is returned if all fail.
pub async fn dial(network: NetworkType, addr: &str) -> io::Result<TcpStream> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await?
        .filter(|a| match network {
            NetworkType::Tcp => true,
            NetworkType::Tcp4 => a.is_ipv4(),
            NetworkType::Tcp6 => a.is_ipv6(),
        })
        .collect();

    let mut last_err = None;
    for candidate in candidates {
        match TcpStream::connect(candidate).await {
            Ok(c) => return Ok(c),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {network} address for {addr}"),
        )
    }))
}
