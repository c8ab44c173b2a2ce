//! Forwarder orchestration.
//!
//! Builds the upstream connector, binds the client listener and runs the
//! accept loop plus periodic statistics.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::session::SessionTimeouts;
use crate::stats::Stats;
use crate::transport::{LinkPolicy, TcpTransport, Upstream, UpstreamConfig, UpstreamConnector, Verification};

/// Default port for client connections.
pub const DEFAULT_LISTEN_PORT: u16 = 8853;

/// Configuration for the forwarder, built once at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to accept DNS-over-TCP clients on.
    pub bind_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub timeouts: SessionTimeouts,
    pub link_policy: LinkPolicy,
    /// Interval between statistics log lines; `None` disables them.
    pub stats_interval: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            upstream: UpstreamConfig::default(),
            timeouts: SessionTimeouts::default(),
            link_policy: LinkPolicy::default(),
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// A bound, not yet running forwarder.
pub struct Proxy {
    transport: TcpTransport,
    upstream: Upstream,
    timeouts: SessionTimeouts,
    stats_interval: Option<Duration>,
    stats: Arc<Stats>,
}

impl Proxy {
    /// Validate the upstream settings and bind the listener.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        if matches!(config.upstream.verification, Verification::Insecure) {
            warn!(
                upstream = %config.upstream.authority(),
                "upstream certificate verification disabled; the resolver is not authenticated"
            );
        }

        let connector = UpstreamConnector::new(config.upstream)?;
        let upstream = Upstream::new(connector, config.link_policy);
        let transport = TcpTransport::bind(config.bind_addr).await?;

        Ok(Self {
            transport,
            upstream,
            timeouts: config.timeouts,
            stats_interval: config.stats_interval,
            stats: Arc::new(Stats::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Start accepting clients in the background.
    pub fn spawn(self) -> JoinHandle<()> {
        if let Some(interval) = self.stats_interval {
            tokio::spawn(report_stats(interval, self.stats.clone(), self.upstream.clone()));
        }

        self.transport.start(self.upstream, self.timeouts, self.stats)
    }
}

/// Run the forwarder with the given configuration.
///
/// Only startup can fail; afterwards the forwarder runs indefinitely.
pub async fn run(config: ProxyConfig) -> Result<(), ProxyError> {
    let upstream = config.upstream.authority();
    let policy = config.link_policy;
    let listen = config.bind_addr;

    let proxy = Proxy::bind(config).await?;

    info!(%listen, %upstream, ?policy, "DNS-over-TLS forwarder started");

    if proxy.spawn().await.is_err() {
        warn!("accept loop stopped");
    }

    Ok(())
}

async fn report_stats(interval: Duration, stats: Arc<Stats>, upstream: Upstream) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip first immediate tick
    loop {
        ticker.tick().await;
        let snap = stats.snapshot_and_reset();
        info!(
            sessions = snap.sessions,
            active = snap.active_sessions,
            forwarded = snap.forwarded,
            failed = snap.failed,
            upstream_connects = upstream.connector().connects(),
            avg_upstream_ms = format_args!("{:.2}", snap.avg_upstream_ms),
            "stats"
        );
    }
}
