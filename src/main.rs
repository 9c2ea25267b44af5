//! CLI entry point: parses stamps and policy knobs, builds the tokio
//! runtime, and runs the proxy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dnscrypt_relay::codec;
use dnscrypt_relay::plugins::NoopPlugins;
use dnscrypt_relay::proxy::{self, Proxy, ProxyConfig};
use dnscrypt_relay::stamp::Stamp;
use dnscrypt_relay::transport::socks::ProxyDialer;

#[derive(Parser)]
#[command(name = "dnscrypt-relay")]
#[command(about = "Encrypted DNS forwarding proxy (DNSCrypt v2 / DoH upstreams)", long_about = None)]
struct Args {
    /// Local address to listen on (UDP and TCP). May be repeated.
    #[arg(short, long, default_values_t = ["127.0.0.1:5353".to_string()])]
    bind: Vec<String>,

    /// sdns:// stamp describing an upstream server. May be repeated.
    #[arg(long = "stamp")]
    stamps: Vec<String>,

    /// Path to a file with one sdns:// stamp per line (blank lines and
    /// lines starting with `#` are skipped).
    #[arg(long)]
    stamps_file: Option<PathBuf>,

    /// Maximum number of client queries admitted concurrently.
    #[arg(long, default_value_t = 250)]
    max_clients: u32,

    /// Per-exchange upstream timeout, in milliseconds.
    #[arg(long, default_value_t = 2500)]
    timeout_ms: u64,

    /// Deadline for a TCP client to finish sending its query, in
    /// milliseconds. Distinct from `timeout_ms`, which bounds the upstream
    /// exchange instead.
    #[arg(long, default_value_t = 5000)]
    client_timeout_ms: u64,

    /// Certificate/reachability refresh interval while servers are healthy,
    /// in seconds.
    #[arg(long, default_value_t = 240)]
    cert_refresh_secs: u64,

    /// Refresh interval used instead of `cert_refresh_secs` while no
    /// server has a live certificate, in seconds.
    #[arg(long, default_value_t = 10)]
    cert_refresh_after_failure_secs: u64,

    /// Accept certificates outside their validity window. For testing
    /// against a server with a skewed clock; never use in production.
    #[arg(long)]
    cert_ignore_timestamp: bool,

    /// Mint a fresh X25519 keypair for every exchange instead of reusing
    /// one for the process lifetime.
    #[arg(long)]
    ephemeral_keys: bool,

    /// Largest UDP reply delivered to a client before truncation.
    #[arg(long, default_value_t = codec::MAX_UDP_DNS)]
    udp_max: usize,

    /// Exit at startup if no upstream server is reachable.
    #[arg(long)]
    require_live_server: bool,

    /// Adopt listener sockets from inherited file descriptors (UDP then
    /// TCP, starting at fd 3, in `--bind` order) instead of binding them.
    /// For use under socket-activation or a privilege-dropping supervisor.
    #[arg(long)]
    listen_fds: bool,

    /// Outbound SOCKS5 proxy (host:port) used to dial DNSCrypt-over-TCP
    /// upstreams, e.g. for egress through Tor.
    #[arg(long)]
    socks_proxy: Option<String>,

    /// Number of tokio worker threads. Defaults to the number of CPUs.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let workers = args.workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?
        .block_on(run(args))
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "dnscrypt_relay=info",
        1 => "dnscrypt_relay=debug",
        _ => "dnscrypt_relay=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();
}

async fn run(args: Args) -> std::io::Result<()> {
    let bind_addrs: Vec<SocketAddr> = args
        .bind
        .iter()
        .map(|s| {
            s.parse()
                .unwrap_or_else(|e| panic!("invalid bind address {s}: {e}"))
        })
        .collect();

    let mut stamp_strs: Vec<String> = args.stamps.clone();
    if let Some(path) = &args.stamps_file {
        let contents = std::fs::read_to_string(path)?;
        stamp_strs.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }

    let dialer = args.socks_proxy.as_ref().map(|s| {
        let addr: SocketAddr = s
            .parse()
            .unwrap_or_else(|e| panic!("invalid socks proxy address {s}: {e}"));
        ProxyDialer::new(addr)
    });

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_millis(args.timeout_ms))
        .build()
        .expect("failed to build HTTP client");

    let config = ProxyConfig {
        bind_addrs,
        max_clients: args.max_clients,
        exchange_timeout: Duration::from_millis(args.timeout_ms),
        client_timeout: Duration::from_millis(args.client_timeout_ms),
        cert_refresh_delay: Duration::from_secs(args.cert_refresh_secs),
        cert_refresh_delay_after_failure: Duration::from_secs(args.cert_refresh_after_failure_secs),
        cert_ignore_timestamp: args.cert_ignore_timestamp,
        ephemeral_keys: args.ephemeral_keys,
        udp_max: args.udp_max,
        require_live_server_at_startup: args.require_live_server,
        listen_fds: args.listen_fds,
    };

    let proxy = Arc::new(Proxy::new(config, http_client, dialer, Arc::new(NoopPlugins)));

    for (i, stamp_str) in stamp_strs.iter().enumerate() {
        match Stamp::parse(stamp_str) {
            Ok(stamp) => {
                let name = format!("{}-{i}", stamp.provider_name);
                proxy.registry.register_server(name, stamp);
            }
            Err(err) => {
                tracing::warn!(%err, stamp = %stamp_str, "skipping unparsable stamp");
            }
        }
    }

    proxy::run(proxy.clone(), args.require_live_server)
        .await
        .map_err(std::io::Error::other)
}
