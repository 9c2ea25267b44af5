//! Error kinds produced by the core. Kept as a single flat enum so every
//! fallible path in the pipeline can propagate with `?` and still carry
//! enough context to log without re-deriving it at the call site.

use std::net::SocketAddr;

/// Errors surfaced while processing a single client query.
///
/// None of these ever escape [`crate::pipeline::process`]: the pipeline
/// catches every variant, optionally notices server health, and always
/// emits exactly one logging event before returning.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("packet too large: {len} bytes (max {max})")]
    Oversize { len: usize, max: usize },

    #[error("packet too small: {len} bytes (min {min})")]
    Undersize { len: usize, min: usize },

    #[error("decryption failed: {0}")]
    Decrypt(&'static str),

    #[error("exchange with {server} timed out after {0:?}", server = .1)]
    Timeout(std::time::Duration, String),

    #[error("transport error talking to {server}: {source}", server = .server)]
    Transport {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http transport error talking to {server}: {source}", server = .server)]
    Http {
        server: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("response parse error: {0}")]
    Parse(&'static str),

    #[error("admission refused: {current}/{max} clients in flight from {addr}")]
    Admission {
        current: u32,
        max: u32,
        addr: SocketAddr,
    },

    #[error("no live upstream server available")]
    NoLiveServer,

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl ProxyError {
    /// Whether this error should count against the originating server's
    /// failure rate (see [`crate::registry::ServerInfo::notice_failure`]).
    pub fn counts_as_server_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Decrypt(_)
                | ProxyError::Timeout(..)
                | ProxyError::Transport { .. }
                | ProxyError::Http { .. }
                | ProxyError::Parse(_)
                | ProxyError::Oversize { .. }
                | ProxyError::Undersize { .. }
        )
    }
}

/// Errors parsing an `sdns://` stamp. Distinct from [`ProxyError`] because
/// stamps are parsed once at registration time, not on the query path.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StampError {
    #[error("missing sdns:// prefix")]
    MissingPrefix,
    #[error("invalid base64url encoding: {0}")]
    Base64(String),
    #[error("stamp is truncated")]
    Truncated,
    #[error("unsupported protocol id {0:#04x}")]
    UnsupportedProtocol(u8),
    #[error("invalid public key length: expected 32, got {0}")]
    BadPublicKey(usize),
    #[error("invalid utf-8 in stamp field")]
    BadUtf8,
}
