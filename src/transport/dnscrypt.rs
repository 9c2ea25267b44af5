//! DNSCrypt upstream exchange over UDP and TCP.
//!
//! Each call owns a fresh socket: there is no connection pooling and no
//! per-server queue, matching the listener's one-task-per-query model.
//! Concurrent in-flight exchanges to the same server are expected and fine.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::codec::{self, MAX_DNS};
use crate::error::ProxyError;
use crate::transport::socks::ProxyDialer;

/// Send `ct_query` to `addr` over UDP, read exactly one datagram back, and
/// return it uninterpreted (still ciphertext — the caller decrypts).
///
/// A single datagram read; no retries at this layer, per the component
/// design: UDP loss is the client's problem to retry.
pub async fn exchange_udp(
    addr: SocketAddr,
    deadline: Duration,
    ct_query: &[u8],
    server_name: &str,
) -> Result<Vec<u8>, ProxyError> {
    timeout(deadline, exchange_udp_inner(addr, ct_query, server_name))
        .await
        .map_err(|_| ProxyError::Timeout(deadline, server_name.to_string()))?
}

async fn exchange_udp_inner(
    addr: SocketAddr,
    ct_query: &[u8],
    server_name: &str,
) -> Result<Vec<u8>, ProxyError> {
    let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|source| transport_err(server_name, source))?;
    socket
        .connect(addr)
        .await
        .map_err(|source| transport_err(server_name, source))?;
    socket
        .send(ct_query)
        .await
        .map_err(|source| transport_err(server_name, source))?;

    let mut buf = vec![0u8; MAX_DNS];
    let len = socket
        .recv(&mut buf)
        .await
        .map_err(|source| transport_err(server_name, source))?;
    buf.truncate(len);
    Ok(buf)
}

/// Send `ct_query` to `addr` over TCP, length-prefixed, and return the
/// response payload (without its length prefix). Uses `dialer` to route
/// through a SOCKS5 outbound proxy when one is configured.
pub async fn exchange_tcp(
    addr: SocketAddr,
    deadline: Duration,
    ct_query: &[u8],
    server_name: &str,
    dialer: Option<&ProxyDialer>,
) -> Result<Vec<u8>, ProxyError> {
    timeout(
        deadline,
        exchange_tcp_inner(addr, ct_query, server_name, dialer),
    )
    .await
    .map_err(|_| ProxyError::Timeout(deadline, server_name.to_string()))?
}

async fn exchange_tcp_inner(
    addr: SocketAddr,
    ct_query: &[u8],
    server_name: &str,
    dialer: Option<&ProxyDialer>,
) -> Result<Vec<u8>, ProxyError> {
    let mut stream = match dialer {
        Some(dialer) => dialer
            .connect(addr)
            .await
            .map_err(|source| transport_err(server_name, source))?,
        None => TcpStream::connect(addr)
            .await
            .map_err(|source| transport_err(server_name, source))?,
    };

    codec::write_prefixed(&mut stream, ct_query, server_name).await?;
    codec::read_prefixed(&mut stream, server_name).await
}

fn transport_err(server_name: &str, source: std::io::Error) -> ProxyError {
    ProxyError::Transport {
        server: server_name.to_string(),
        source,
    }
}
