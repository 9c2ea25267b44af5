//! Server registry: holds every registered upstream, refreshes DNSCrypt
//! certificates and probes DoH reachability, tracks liveness, and picks one
//! server per query.
//!
//! Readers never hold a lock across an exchange: [`ServerRegistry::get_one`]
//! clones an `Arc<ServerInfo>` and releases the map lock immediately.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

use crate::certificate::{self, Certificate};
use crate::codec;
use crate::error::ProxyError;
use crate::stamp::{Stamp, StampProtocol};
use crate::transport::{dnscrypt, socks::ProxyDialer};

/// A failure rate past which a server is excluded from [`ServerRegistry::get_one`]
/// until its cool-down window elapses.
const FAILURE_THRESHOLD: f64 = 3.0;
/// How long a server stays excluded after crossing [`FAILURE_THRESHOLD`].
const COOLDOWN: Duration = Duration::from_secs(30);
/// Decay applied to the failure counter on every successful exchange.
const SUCCESS_DECAY: f64 = 0.5;

/// A server named and described by its stamp, as handed to
/// [`ServerRegistry::register_server`]. Resolution and probing happen
/// lazily, on the next [`ServerRegistry::refresh`].
#[derive(Debug, Clone)]
pub struct RegisteredServer {
    pub name: String,
    pub stamp: Stamp,
}

/// Upstream protocol facets, immutable once a [`ServerInfo`] exists.
///
/// DNSCrypt carries far more state than DoH (address pair, pinned key,
/// installed certificate); the size gap is inherent to the protocol, not
/// worth boxing away for the occasional extra stack copy.
#[allow(clippy::large_enum_variant)]
pub enum Protocol {
    DnsCrypt {
        long_term_pk: [u8; 32],
        udp_addr: SocketAddr,
        tcp_addr: SocketAddr,
        cert: RwLock<Option<Certificate>>,
    },
    Doh {
        url: String,
        use_get: bool,
    },
}

struct Health {
    failure_rate: f64,
    latency_ms: f64,
    unhealthy_until: Option<Instant>,
    exchange_start: Option<Instant>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency_ms: 50.0,
            unhealthy_until: None,
            exchange_start: None,
        }
    }
}

/// One live (or recently live) upstream. Health facets use interior
/// mutability behind a small mutex: updates are frequent and racy by
/// design, exact arithmetic doesn't matter as long as the trend holds.
pub struct ServerInfo {
    pub name: String,
    pub protocol: Protocol,
    pub timeout: Duration,
    health: Mutex<Health>,
}

impl ServerInfo {
    fn new(name: String, protocol: Protocol, timeout: Duration) -> Self {
        Self {
            name,
            protocol,
            timeout,
            health: Mutex::new(Health::default()),
        }
    }

    /// Record the start of an exchange, for latency measurement.
    pub fn notice_begin(&self) {
        self.health.lock().unwrap().exchange_start = Some(Instant::now());
    }

    /// Decay the failure counter toward 0 and update the latency EMA.
    pub fn notice_success(&self) {
        let mut health = self.health.lock().unwrap();
        health.failure_rate *= SUCCESS_DECAY;
        if let Some(start) = health.exchange_start.take() {
            let observed = start.elapsed().as_secs_f64() * 1000.0;
            health.latency_ms = health.latency_ms * 0.8 + observed * 0.2;
        }
    }

    /// Bump the failure counter; once it crosses [`FAILURE_THRESHOLD`] the
    /// server is excluded from selection for [`COOLDOWN`].
    pub fn notice_failure(&self) {
        let mut health = self.health.lock().unwrap();
        health.exchange_start = None;
        health.failure_rate += 1.0;
        if health.failure_rate >= FAILURE_THRESHOLD {
            health.unhealthy_until = Some(Instant::now() + COOLDOWN);
        }
    }

    /// Whether this server currently qualifies for [`ServerRegistry::get_one`]:
    /// not in its cool-down window, and (for DNSCrypt) holding a certificate
    /// valid right now.
    pub fn is_live(&self, cert_ignore_timestamp: bool) -> bool {
        let cooled_down = {
            let health = self.health.lock().unwrap();
            health.unhealthy_until.is_none_or(|until| Instant::now() >= until)
        };
        if !cooled_down {
            return false;
        }
        match &self.protocol {
            Protocol::DnsCrypt { cert, .. } => cert
                .read()
                .unwrap()
                .as_ref()
                .is_some_and(|c| c.is_valid_at(now_unix(), cert_ignore_timestamp)),
            Protocol::Doh { .. } => true,
        }
    }

    /// Selection weight: inversely proportional to recent failure rate and
    /// latency. Never zero, so a server with no history is still eligible.
    fn selection_weight(&self) -> f64 {
        let health = self.health.lock().unwrap();
        1.0 / (1.0 + health.failure_rate) / (1.0 + health.latency_ms / 100.0)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Holds every registered upstream, refreshes their certificates/reachability,
/// and selects one per query. See the module docs for the locking discipline.
pub struct ServerRegistry {
    registered: RwLock<FxHashMap<String, RegisteredServer>>,
    servers: RwLock<FxHashMap<String, Arc<ServerInfo>>>,
    http_client: reqwest::Client,
    cert_ignore_timestamp: bool,
    dialer: Option<ProxyDialer>,
    exchange_timeout: Duration,
}

impl ServerRegistry {
    pub fn new(
        http_client: reqwest::Client,
        cert_ignore_timestamp: bool,
        dialer: Option<ProxyDialer>,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            registered: RwLock::new(FxHashMap::default()),
            servers: RwLock::new(FxHashMap::default()),
            http_client,
            cert_ignore_timestamp,
            dialer,
            exchange_timeout,
        }
    }

    /// Register a stamp under `name`. Address resolution and the first
    /// certificate bootstrap happen lazily, on the next [`Self::refresh`].
    pub fn register_server(&self, name: impl Into<String>, stamp: Stamp) {
        let name = name.into();
        self.registered
            .write()
            .unwrap()
            .insert(name.clone(), RegisteredServer { name, stamp });
    }

    /// Probe every registered server. Returns the number of currently live
    /// servers after the probe. A server that fails its probe is demoted
    /// (excluded from [`Self::get_one`]) but never removed from the map —
    /// only an explicit stamp withdrawal does that.
    pub async fn refresh(&self) -> usize {
        let registered: Vec<RegisteredServer> =
            self.registered.read().unwrap().values().cloned().collect();

        for reg in &registered {
            match self.probe(reg).await {
                Ok(info) => {
                    debug!(server = %reg.name, "probe succeeded");
                    self.servers.write().unwrap().insert(reg.name.clone(), Arc::new(info));
                }
                Err(err) => {
                    warn!(server = %reg.name, error = %err, "probe failed, demoting");
                    if let Some(existing) = self.servers.read().unwrap().get(&reg.name) {
                        existing.notice_failure();
                    }
                }
            }
        }

        self.live_servers()
    }

    async fn probe(&self, reg: &RegisteredServer) -> Result<ServerInfo, ProxyError> {
        match &reg.stamp.protocol {
            StampProtocol::DnsCrypt { addr, public_key } => {
                self.probe_dnscrypt(reg, addr, public_key).await
            }
            StampProtocol::Doh { .. } => self.probe_doh(reg).await,
        }
    }

    async fn probe_dnscrypt(
        &self,
        reg: &RegisteredServer,
        addr: &str,
        public_key: &[u8; 32],
    ) -> Result<ServerInfo, ProxyError> {
        let socket_addr = resolve(addr).await?;
        let bootstrap_query = certificate::build_bootstrap_query(&reg.stamp.provider_name);

        let response =
            match dnscrypt::exchange_udp(socket_addr, self.exchange_timeout, &bootstrap_query, &reg.name)
                .await
            {
                Ok(resp) if codec::has_tc(&resp) => {
                    dnscrypt::exchange_tcp(
                        socket_addr,
                        self.exchange_timeout,
                        &bootstrap_query,
                        &reg.name,
                        self.dialer.as_ref(),
                    )
                    .await?
                }
                Ok(resp) => resp,
                Err(_) => {
                    dnscrypt::exchange_tcp(
                        socket_addr,
                        self.exchange_timeout,
                        &bootstrap_query,
                        &reg.name,
                        self.dialer.as_ref(),
                    )
                    .await?
                }
            };

        let candidates = certificate::extract_txt_records(&response)?;
        let best = candidates
            .iter()
            .filter_map(|blob| certificate::verify_and_parse(blob, public_key))
            .filter(|c| c.is_valid_at(now_unix(), self.cert_ignore_timestamp))
            .max_by_key(|c| c.serial)
            .ok_or(ProxyError::Parse("no valid certificate in bootstrap response"))?;

        let info = ServerInfo::new(
            reg.name.clone(),
            Protocol::DnsCrypt {
                long_term_pk: *public_key,
                udp_addr: socket_addr,
                tcp_addr: socket_addr,
                cert: RwLock::new(Some(best)),
            },
            self.exchange_timeout,
        );
        Ok(info)
    }

    async fn probe_doh(&self, reg: &RegisteredServer) -> Result<ServerInfo, ProxyError> {
        let StampProtocol::Doh { hostname, path, .. } = &reg.stamp.protocol else {
            unreachable!("probe_doh called with non-DoH stamp");
        };
        let url = format!("https://{hostname}{path}");
        let canned_query = certificate::build_bootstrap_query("health-check.invalid");

        crate::transport::doh::exchange(&self.http_client, &url, false, &canned_query, &reg.name)
            .await?;

        Ok(ServerInfo::new(
            reg.name.clone(),
            Protocol::Doh { url, use_get: false },
            self.exchange_timeout,
        ))
    }

    /// Select a live server using weighted random choice biased inversely
    /// by recent failure count and latency. `None` if no server is live.
    pub fn get_one(&self) -> Option<Arc<ServerInfo>> {
        let servers = self.servers.read().unwrap();
        let live: Vec<&Arc<ServerInfo>> = servers
            .values()
            .filter(|s| s.is_live(self.cert_ignore_timestamp))
            .collect();
        if live.is_empty() {
            return None;
        }

        let weights: Vec<f64> = live.iter().map(|s| s.selection_weight()).collect();
        let total: f64 = weights.iter().sum();
        let mut pick = rand::rng().random_range(0.0..total);
        for (server, weight) in live.iter().zip(weights.iter()) {
            if pick < *weight {
                return Some(Arc::clone(server));
            }
            pick -= weight;
        }
        live.last().map(|s| Arc::clone(s))
    }

    /// Monotone count of currently usable servers.
    pub fn live_servers(&self) -> usize {
        self.servers
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_live(self.cert_ignore_timestamp))
            .count()
    }

    /// The HTTP client used for DoH probing and, via the pipeline, for
    /// actual query forwarding.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// The outbound SOCKS5 dialer configured for DNSCrypt-over-TCP, if any.
    pub fn dialer(&self) -> Option<&ProxyDialer> {
        self.dialer.as_ref()
    }

    pub fn log_summary(&self) {
        info!(live = self.live_servers(), registered = self.registered.read().unwrap().len(), "registry refreshed");
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, ProxyError> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    lookup_host(addr)
        .await
        .map_err(|source| ProxyError::Transport {
            server: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ProxyError::Transport {
            server: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_timeout(timeout: Duration) -> ServerInfo {
        ServerInfo::new(
            "test".to_string(),
            Protocol::Doh {
                url: "https://example.invalid/dns-query".to_string(),
                use_get: false,
            },
            timeout,
        )
    }

    #[test]
    fn doh_server_is_live_without_certificate() {
        let info = info_with_timeout(Duration::from_secs(1));
        assert!(info.is_live(false));
    }

    #[test]
    fn failure_threshold_demotes_server() {
        let info = info_with_timeout(Duration::from_secs(1));
        for _ in 0..3 {
            info.notice_failure();
        }
        assert!(!info.is_live(false));
    }

    #[test]
    fn success_decays_failure_rate_back_to_live() {
        let info = info_with_timeout(Duration::from_secs(1));
        info.notice_failure();
        info.notice_failure();
        info.notice_success();
        info.notice_success();
        info.notice_success();
        assert!(info.is_live(false));
    }

    #[tokio::test]
    async fn empty_registry_returns_no_server() {
        let registry = ServerRegistry::new(
            reqwest::Client::new(),
            false,
            None,
            Duration::from_secs(1),
        );
        assert_eq!(registry.get_one().map(|_| ()), None);
        assert_eq!(registry.live_servers(), 0);
    }
}
