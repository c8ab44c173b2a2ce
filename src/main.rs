use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dotfwd::proxy::{self, DEFAULT_LISTEN_PORT, ProxyConfig};
use dotfwd::session::SessionTimeouts;
use dotfwd::transport::tls::DEFAULT_DOT_PORT;
use dotfwd::transport::{LinkPolicy, UpstreamConfig, Verification};

#[derive(Parser)]
#[command(name = "dotfwd")]
#[command(about = "Forward DNS-over-TCP clients to a DNS-over-TLS resolver", long_about = None)]
struct Args {
    /// Upstream DNS-over-TLS resolver (host name or IP)
    #[arg(default_value = "8.8.8.8")]
    upstream: String,

    /// Local port to listen on
    #[arg(default_value_t = DEFAULT_LISTEN_PORT)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Upstream DNS-over-TLS port
    #[arg(long, default_value_t = DEFAULT_DOT_PORT)]
    upstream_port: u16,

    /// Name to verify the upstream certificate against (defaults to UPSTREAM)
    #[arg(long)]
    tls_name: Option<String>,

    /// Extra PEM file of trusted CA certificates
    #[arg(long, conflicts_with = "insecure")]
    ca_file: Option<PathBuf>,

    /// Accept any upstream certificate (encrypts but does not authenticate)
    #[arg(long)]
    insecure: bool,

    /// Close clients idle for this long
    #[arg(long, default_value_t = 2000)]
    idle_timeout_ms: u64,

    /// Bound on each upstream write, upstream read and client reply
    #[arg(long, default_value_t = 2000)]
    request_timeout_ms: u64,

    /// Bound on upstream TCP connect plus TLS handshake
    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,

    /// Share this many upstream links across clients (0 = one link per client)
    #[arg(long, default_value_t = 0)]
    pool_size: usize,

    /// Seconds between statistics lines (0 = off)
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig> {
        let verification = match (&self.ca_file, self.insecure) {
            (_, true) => Verification::Insecure,
            (Some(path), false) => Verification::with_ca_file(path)?,
            (None, false) => Verification::default(),
        };

        let link_policy = match self.pool_size {
            0 => LinkPolicy::PerSession,
            size => LinkPolicy::Pooled { size },
        };

        Ok(ProxyConfig {
            bind_addr: SocketAddr::new(self.bind, self.port),
            upstream: UpstreamConfig {
                host: self.upstream,
                port: self.upstream_port,
                tls_name: self.tls_name,
                verification,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                ..Default::default()
            },
            timeouts: SessionTimeouts {
                idle: Duration::from_millis(self.idle_timeout_ms),
                request: Duration::from_millis(self.request_timeout_ms),
            },
            link_policy,
            stats_interval: (self.stats_interval_secs > 0)
                .then(|| Duration::from_secs(self.stats_interval_secs)),
        })
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = args.into_config()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        tokio::select! {
            result = proxy::run(config) => result?,
            _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
        }
        Ok::<(), anyhow::Error>(())
    })
}
