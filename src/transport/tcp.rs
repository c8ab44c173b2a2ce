//! TCP transport for client connections.
//!
//! Accepts DNS-over-TCP clients and runs one forwarding session per
//! connection, each in its own task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use super::upstream::Upstream;
use crate::error::{BindError, SessionError};
use crate::session::{ClientSession, SessionTimeouts};
use crate::stats::{ActiveSession, Stats};

/// Pause after a failed accept so a persistent error (e.g. descriptor
/// exhaustion) does not spin the loop.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// TCP transport for the forwarder.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> Result<Self, BindError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BindError::from_io(addr, e))?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start(self, upstream: Upstream, timeouts: SessionTimeouts, stats: Arc<Stats>) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, upstream, timeouts, stats))
    }
}

/// Accept loop - spawns a session task for each incoming connection.
///
/// A failed accept only affects that connection; the loop keeps going.
async fn run_accept_loop(
    listener: TcpListener,
    upstream: Upstream,
    timeouts: SessionTimeouts,
    stats: Arc<Stats>,
) {
    let mut next_id: u64 = 0;

    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                next_id += 1;
                let _ = client.set_nodelay(true);

                let session = ClientSession::new(
                    next_id,
                    client,
                    peer,
                    upstream.session(next_id),
                    timeouts,
                    stats.clone(),
                );
                let active = stats.session_started();
                let span = info_span!("session", id = session.id(), peer = %session.peer());

                tokio::spawn(handle_connection(session, active).instrument(span));
            }
            Err(e) => {
                warn!(error = %e, "TCP accept error");
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            }
        }
    }
}

/// Run a session to completion and log how it ended.
async fn handle_connection(session: ClientSession, _active: ActiveSession) {
    debug!("client connected");

    match session.run().await {
        Ok(()) => debug!("client disconnected"),
        Err(SessionError::Idle(idle)) => {
            debug!(idle_ms = idle.as_millis() as u64, "closing idle client")
        }
        Err(e) => warn!(error = %e, "closing client connection"),
    }
}
