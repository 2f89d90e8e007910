use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

const LISTEN_BACKLOG: i32 = 1024;

/// Binds `host:port`; `*` listens on every interface, dual-stack when the OS allows it.
pub async fn create_listener(
    host: &str,
    port: u16,
) -> std::io::Result<(String, tokio::net::TcpListener)> {
    if host == "*" {
        return create_wildcard_listener(port);
    }

    let addr = format!("{}:{}", host, port);
    tracing::info!("Attempting to bind server to {}...", addr);

    let tokio_listener = tokio::net::TcpListener::bind(&addr).await?;

    Ok((addr, tokio_listener))
}

fn bind_socket(domain: Domain, addr: SocketAddr, dual_stack: bool) -> std::io::Result<tokio::net::TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if dual_stack {
        if let Err(e) = socket.set_only_v6(false) {
            tracing::warn!(
                "Failed to set dual-stack mode for IPv6 socket: {}. Continuing anyway.",
                e
            );
        }
    }

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener)
}

fn create_wildcard_listener(port: u16) -> std::io::Result<(String, tokio::net::TcpListener)> {
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    tracing::info!("Attempting to bind server to {}... (IPv6 + IPv4 dual-stack)", v6);

    match bind_socket(Domain::IPV6, v6, true) {
        Ok(listener) => return Ok((v6.to_string(), listener)),
        Err(e) => tracing::warn!("Failed to bind IPv6 listener ({}). Attempting IPv4 only.", e),
    }

    let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    tracing::info!("Attempting to bind server to {}... (IPv4)", v4);

    let listener = bind_socket(Domain::IPV4, v4, false)?;
    Ok((v4.to_string(), listener))
}
