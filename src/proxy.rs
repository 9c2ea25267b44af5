//! Proxy lifecycle: process-wide state, startup, and the background
//! certificate-refresh schedule.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::admission::Admission;
use crate::crypto::Keypair;
use crate::error::ProxyError;
use crate::estimator::QuestionSizeEstimator;
use crate::listener::{self, BindSpec};
use crate::plugins::Plugins;
use crate::registry::ServerRegistry;
use crate::transport::socks::ProxyDialer;

/// First file descriptor a privilege-dropping supervisor or socket-activation
/// launcher hands down a listener on, per the runtime-handoff contract: UDP
/// first, then TCP, in configuration order.
const FIRST_INHERITED_FD: std::os::fd::RawFd = 3;

/// Static configuration, set once at startup from CLI arguments.
pub struct ProxyConfig {
    pub bind_addrs: Vec<SocketAddr>,
    pub max_clients: u32,
    pub exchange_timeout: Duration,
    pub client_timeout: Duration,
    pub cert_refresh_delay: Duration,
    pub cert_refresh_delay_after_failure: Duration,
    pub cert_ignore_timestamp: bool,
    pub ephemeral_keys: bool,
    pub udp_max: usize,
    pub require_live_server_at_startup: bool,
    /// Adopt listener sockets from inherited file descriptors starting at
    /// fd 3 (UDP then TCP, per `bind_addrs` order) instead of binding them.
    pub listen_fds: bool,
}

/// Process-wide proxy state: one instance lives for the life of the
/// process and is shared (via `Arc`) across every listener task.
pub struct Proxy {
    pub registry: ServerRegistry,
    pub plugins: Arc<dyn Plugins>,
    pub keypair: Keypair,
    pub ephemeral_keys: bool,
    pub estimator: QuestionSizeEstimator,
    pub admission: Admission,
    pub udp_max: usize,
    pub bind_addrs: Vec<SocketAddr>,
    pub client_timeout: Duration,
    pub cert_refresh_delay: Duration,
    pub cert_refresh_delay_after_failure: Duration,
    pub listen_fds: bool,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        http_client: reqwest::Client,
        dialer: Option<ProxyDialer>,
        plugins: Arc<dyn Plugins>,
    ) -> Self {
        let registry = ServerRegistry::new(
            http_client,
            config.cert_ignore_timestamp,
            dialer,
            config.exchange_timeout,
        );
        Self {
            registry,
            plugins,
            keypair: Keypair::generate(),
            ephemeral_keys: config.ephemeral_keys,
            estimator: QuestionSizeEstimator::new(),
            admission: Admission::new(config.max_clients),
            udp_max: config.udp_max,
            bind_addrs: config.bind_addrs,
            client_timeout: config.client_timeout,
            cert_refresh_delay: config.cert_refresh_delay,
            cert_refresh_delay_after_failure: config.cert_refresh_delay_after_failure,
            listen_fds: config.listen_fds,
        }
    }
}

/// Resolve how the listener at bind-address index `i` should obtain its
/// sockets: adopted inherited fds (UDP then TCP, starting at fd 3) when
/// `listen_fds` is set, otherwise bound fresh from `addr`.
fn bind_specs_for(listen_fds: bool, i: usize, addr: SocketAddr) -> (BindSpec, BindSpec) {
    if listen_fds {
        let udp_fd = FIRST_INHERITED_FD + 2 * i as i32;
        let tcp_fd = udp_fd + 1;
        (BindSpec::Fd(udp_fd), BindSpec::Fd(tcp_fd))
    } else {
        (BindSpec::Addr(addr), BindSpec::Addr(addr))
    }
}

/// Run the proxy: perform the initial certificate/reachability refresh,
/// spawn the background refresh schedule, and serve every configured bind
/// address until a listener fails or the process is signaled to stop.
pub async fn run(proxy: Arc<Proxy>, require_live_server: bool) -> Result<(), ProxyError> {
    let live = proxy.registry.refresh().await;
    proxy.registry.log_summary();
    if live == 0 && require_live_server {
        return Err(ProxyError::Fatal(
            "no live upstream server after initial refresh".to_string(),
        ));
    }

    spawn_prefetch(Arc::clone(&proxy));

    let mut listeners = Vec::new();
    for (i, addr) in proxy.bind_addrs.iter().enumerate() {
        let addr_owned = *addr;
        let (udp_bind, tcp_bind) = bind_specs_for(proxy.listen_fds, i, addr_owned);

        let udp_proxy = Arc::clone(&proxy);
        listeners.push(tokio::spawn(async move {
            if let Err(err) = listener::run_udp(udp_bind, udp_proxy).await {
                error!(%addr_owned, ?udp_bind, %err, "udp listener exited");
            }
        }));

        let tcp_proxy = Arc::clone(&proxy);
        listeners.push(tokio::spawn(async move {
            if let Err(err) = listener::run_tcp(tcp_bind, tcp_proxy).await {
                error!(%addr_owned, ?tcp_bind, %err, "tcp listener exited");
            }
        }));
    }

    for handle in listeners {
        let _ = handle.await;
    }
    Ok(())
}

/// Background certificate/reachability refresh. Runs until the process
/// exits; interval alternates between `cert_refresh_delay` (servers are
/// healthy) and the shorter `cert_refresh_delay_after_failure` (at least
/// one server has no live certificate), so an outage is retried sooner
/// than routine housekeeping would.
fn spawn_prefetch(proxy: Arc<Proxy>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let live = proxy.registry.live_servers();
            let delay = if live == 0 {
                proxy.cert_refresh_delay_after_failure
            } else {
                proxy.cert_refresh_delay
            };
            tokio::time::sleep(delay).await;

            let live_after = proxy.registry.refresh().await;
            info!(live = live_after, "background certificate refresh complete");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_specs_use_addr_when_listen_fds_disabled() {
        let addr: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let (udp, tcp) = bind_specs_for(false, 2, addr);
        assert!(matches!(udp, BindSpec::Addr(a) if a == addr));
        assert!(matches!(tcp, BindSpec::Addr(a) if a == addr));
    }

    #[test]
    fn bind_specs_assign_udp_then_tcp_fds_in_order() {
        let addr: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let (udp0, tcp0) = bind_specs_for(true, 0, addr);
        assert!(matches!(udp0, BindSpec::Fd(3)));
        assert!(matches!(tcp0, BindSpec::Fd(4)));

        let (udp1, tcp1) = bind_specs_for(true, 1, addr);
        assert!(matches!(udp1, BindSpec::Fd(5)));
        assert!(matches!(tcp1, BindSpec::Fd(6)));
    }
}
