//! Minimal SOCKS5 CONNECT dialer, used when a proxy configures an outbound
//! proxy for reaching DNSCrypt-over-TCP upstreams (e.g. to egress through a
//! Tor or corporate proxy). No-auth only; that's all DNSCrypt upstream
//! dialing needs.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A configured SOCKS5 proxy endpoint used to dial upstream TCP servers.
#[derive(Debug, Clone)]
pub struct ProxyDialer {
    pub proxy_addr: SocketAddr,
}

impl ProxyDialer {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self { proxy_addr }
    }

    /// Dial `target` through the SOCKS5 proxy using a no-auth CONNECT.
    pub async fn connect(&self, target: SocketAddr) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect(self.proxy_addr).await?;

        // Greeting: version 5, 1 method, no-auth.
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut greeting_reply = [0u8; 2];
        stream.read_exact(&mut greeting_reply).await?;
        if greeting_reply != [0x05, 0x00] {
            return Err(io::Error::other("SOCKS5 proxy rejected no-auth greeting"));
        }

        let mut request = vec![0x05, 0x01, 0x00];
        match target {
            SocketAddr::V4(addr) => {
                request.push(0x01);
                request.extend_from_slice(&addr.ip().octets());
            }
            SocketAddr::V6(addr) => {
                request.push(0x04);
                request.extend_from_slice(&addr.ip().octets());
            }
        }
        request.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&request).await?;

        let mut reply_header = [0u8; 4];
        stream.read_exact(&mut reply_header).await?;
        if reply_header[1] != 0x00 {
            return Err(io::Error::other(format!(
                "SOCKS5 CONNECT failed, reply code {}",
                reply_header[1]
            )));
        }
        // Skip the bound address the proxy reports back.
        let addr_len = match reply_header[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => {
                return Err(io::Error::other(format!("unknown SOCKS5 address type {other}")));
            }
        };
        let mut discard = vec![0u8; addr_len + 2]; // address + port
        stream.read_exact(&mut discard).await?;

        Ok(stream)
    }
}
