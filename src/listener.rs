//! Listener loops: accept client traffic on UDP and TCP and hand each query
//! to the pipeline. One task per query (UDP) or per connection (TCP),
//! gated by the shared [`Admission`] counter.

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec;
use crate::crypto::Keypair;
use crate::oob;
use crate::pipeline::{self, PipelineDeps};
use crate::plugins::ClientProto;
use crate::proxy::Proxy;

/// Where a listener socket comes from: bound here, or adopted from an
/// already-open file descriptor handed down by a privilege-dropping
/// supervisor or socket-activation launcher.
#[derive(Debug, Clone, Copy)]
pub enum BindSpec {
    Addr(SocketAddr),
    Fd(RawFd),
}

/// Adopt an inherited UDP socket. The fd must be open, a UDP socket, and not
/// used anywhere else in the process; ownership transfers to the returned
/// `UdpSocket`.
fn udp_socket_from_fd(fd: RawFd) -> std::io::Result<UdpSocket> {
    // SAFETY: caller (proxy startup) guarantees `fd` is a valid, open UDP
    // socket fd inherited from a parent process and not otherwise in use.
    let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    std_socket.set_nonblocking(true)?;
    UdpSocket::from_std(std_socket)
}

/// Adopt an inherited TCP listening socket, analogous to
/// [`udp_socket_from_fd`].
fn tcp_listener_from_fd(fd: RawFd) -> std::io::Result<TcpListener> {
    // SAFETY: caller guarantees `fd` is a valid, open, already-listening TCP
    // socket fd inherited from a parent process and not otherwise in use.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Bind (or adopt) and run the UDP listener until the process exits or the
/// socket errors. Each datagram is admission-gated and handled on its own
/// spawned task so one slow upstream never head-of-line blocks others.
pub async fn run_udp(bind: BindSpec, proxy: Arc<Proxy>) -> std::io::Result<()> {
    let socket = match bind {
        BindSpec::Addr(addr) => UdpSocket::bind(addr).await?,
        BindSpec::Fd(fd) => udp_socket_from_fd(fd)?,
    };
    let is_ipv6 = socket.local_addr()?.is_ipv6();
    let socket = Arc::new(socket);
    if let Err(err) = oob::enable_pktinfo(&socket, is_ipv6) {
        debug!(%err, "ancillary destination-address tracking unavailable, replies will use the default source");
    }

    let mut buf = vec![0u8; codec::MAX_DNS];
    loop {
        let (len, client_addr, dst_hint) = match oob::recv_with_dst(&socket, &mut buf).await {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "udp recv failed");
                continue;
            }
        };
        let query = buf[..len].to_vec();

        let Some(guard) = proxy.admission.try_acquire() else {
            if proxy.admission.note_refusal() {
                warn!(
                    %client_addr,
                    current = proxy.admission.current(),
                    max = proxy.admission.max_clients(),
                    "admission refused, dropping datagrams (rate-limited log)"
                );
            }
            continue;
        };

        let socket = Arc::clone(&socket);
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let _guard = guard;
            if let Some(response) = handle_query(&proxy, ClientProto::Udp, client_addr, query).await
                && let Err(err) = oob::send_with_src(&socket, &response, client_addr, dst_hint).await
            {
                warn!(%client_addr, %err, "udp send failed");
            }
        });
    }
}

/// Bind (or adopt) and run the TCP listener. Each connection is expected to
/// carry exactly one length-prefixed query/response, per the traditional
/// DNS-over-TCP contract; the connection closes after.
pub async fn run_tcp(bind: BindSpec, proxy: Arc<Proxy>) -> std::io::Result<()> {
    let listener = match bind {
        BindSpec::Addr(addr) => TcpListener::bind(addr).await?,
        BindSpec::Fd(fd) => tcp_listener_from_fd(fd)?,
    };

    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "tcp accept failed");
                continue;
            }
        };

        let Some(guard) = proxy.admission.try_acquire() else {
            if proxy.admission.note_refusal() {
                warn!(
                    %client_addr,
                    current = proxy.admission.current(),
                    max = proxy.admission.max_clients(),
                    "admission refused, closing connections (rate-limited log)"
                );
            }
            continue;
        };

        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let _guard = guard;
            handle_tcp_connection(proxy, stream, client_addr).await;
        });
    }
}

async fn handle_tcp_connection(proxy: Arc<Proxy>, mut stream: tokio::net::TcpStream, client_addr: SocketAddr) {
    let query = match timeout(
        proxy.client_timeout,
        codec::read_prefixed(&mut stream, &client_addr.to_string()),
    )
    .await
    {
        Ok(Ok(q)) => q,
        Ok(Err(err)) => {
            debug!(%client_addr, %err, "tcp read failed");
            return;
        }
        Err(_) => {
            debug!(%client_addr, timeout = ?proxy.client_timeout, "tcp client read timed out");
            return;
        }
    };

    if let Some(response) = handle_query(&proxy, ClientProto::Tcp, client_addr, query).await
        && let Err(err) =
            codec::write_prefixed(&mut stream, &response, &client_addr.to_string()).await
    {
        debug!(%client_addr, %err, "tcp write failed");
    }
}

async fn handle_query(
    proxy: &Proxy,
    client_proto: ClientProto,
    client_addr: SocketAddr,
    query: Vec<u8>,
) -> Option<Vec<u8>> {
    let keypair: &Keypair = &proxy.keypair;
    let deps = PipelineDeps {
        registry: &proxy.registry,
        plugins: proxy.plugins.as_ref(),
        keypair,
        ephemeral_keys: proxy.ephemeral_keys,
        estimator: &proxy.estimator,
        udp_max: proxy.udp_max,
    };
    pipeline::process(&deps, client_proto, client_addr, query).await
}
