//! The plugin pipeline's interface.
//!
//! The pipeline itself (block/allow lists, cloaking, cache, logging sinks)
//! is explicitly out of scope: this module only specifies the narrow
//! capability set the query pipeline invokes it through, plus a no-op
//! implementation so the core is runnable and testable standalone.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use crate::error::ProxyError;

/// Which transport carried the client's query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProto {
    Udp,
    Tcp,
}

/// The decision `apply_query_plugins` makes for a single query.
///
/// Modeled as a tagged variant (not a trait object or inheritance
/// hierarchy): `Synth` carries its own payload rather than requiring a
/// second lookup.
#[derive(Debug, Clone)]
pub enum Action {
    /// Forward to the chosen upstream server.
    Forward,
    /// Drop with no reply to the client.
    Drop,
    /// Reply immediately with a synthesized response, bypassing upstream.
    Synth(Vec<u8>),
}

/// Outcome code recorded purely for the external logger; the pipeline
/// itself never branches on this beyond what `Action` already encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Pass,
    Forward,
    Drop,
    Synth,
    ParseError,
    ServerError,
    Cloak,
    NxDomain,
    Whitelist,
}

/// Per-query state threaded through the pipeline and handed to
/// `apply_logging_plugins` exactly once on every terminal path.
#[derive(Debug, Clone)]
pub struct PluginsState {
    pub client_proto: ClientProto,
    pub client_addr: SocketAddr,
    pub start_time: Instant,
    pub server_name: Option<String>,
    pub return_code: ReturnCode,
}

impl PluginsState {
    pub fn new(client_proto: ClientProto, client_addr: SocketAddr) -> Self {
        Self {
            client_proto,
            client_addr,
            start_time: Instant::now(),
            server_name: None,
            return_code: ReturnCode::Pass,
        }
    }
}

/// The narrow capability set the query pipeline invokes plugins through.
/// A concrete implementation (block lists, cache, cloaking, log sinks) is
/// an external collaborator; this trait is the whole contract the core
/// depends on.
pub trait Plugins: Send + Sync {
    /// Inspect or mutate `query` in place and decide what to do with it.
    /// `server_name` is `None` until a server has been selected.
    fn apply_query(&self, query: &mut Vec<u8>, server_name: Option<&str>) -> Action;

    /// Inspect or mutate `response` in place after a successful upstream
    /// exchange (or after synthesis). `ttl_out` is an optional out-param
    /// for a plugin that wants to report a TTL override; the core computes
    /// it but currently does not read it back (see design notes).
    fn apply_response(
        &self,
        response: &mut Vec<u8>,
        ttl_out: &mut Option<u32>,
    ) -> Result<(), ProxyError>;

    /// Called exactly once per query, on every terminal path, after the
    /// reply has been written (or dropped).
    fn apply_logging(&self, state: &PluginsState);
}

/// A pass-through implementation: forwards every query, never mutates a
/// response, and logs through `tracing`. Used when no richer plugin
/// pipeline is wired in (e.g. tests, or a minimal deployment).
pub struct NoopPlugins;

impl Plugins for NoopPlugins {
    fn apply_query(&self, _query: &mut Vec<u8>, _server_name: Option<&str>) -> Action {
        Action::Forward
    }

    fn apply_response(
        &self,
        _response: &mut Vec<u8>,
        _ttl_out: &mut Option<u32>,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    fn apply_logging(&self, state: &PluginsState) {
        debug!(
            client = %state.client_addr,
            proto = ?state.client_proto,
            server = state.server_name.as_deref().unwrap_or("-"),
            return_code = ?state.return_code,
            elapsed_ms = state.start_time.elapsed().as_secs_f64() * 1000.0,
            "query handled"
        );
    }
}
