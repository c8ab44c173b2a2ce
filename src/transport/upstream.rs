//! Upstream access for one client session.
//!
//! [`Upstream`] is the proxy-wide handle built from the configured
//! [`LinkPolicy`]; each session takes a [`SessionUpstream`] from it and runs
//! its exchanges through that.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::pool::{IdMap, LinkPool, PendingQuery};
use super::tls::{UpstreamConnector, UpstreamLink};
use crate::error::ForwardError;
use crate::frame::Frame;

/// Lifetime policy for upstream links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPolicy {
    /// Each session lazily opens its own link and closes it on exit.
    /// Client transaction IDs go upstream unchanged.
    #[default]
    PerSession,
    /// Sessions share `size` links; IDs are remapped per query.
    Pooled { size: usize },
}

/// Proxy-wide upstream handle.
#[derive(Clone)]
pub enum Upstream {
    PerSession(Arc<UpstreamConnector>),
    Pooled(Arc<LinkPool>),
}

impl Upstream {
    pub fn new(connector: UpstreamConnector, policy: LinkPolicy) -> Self {
        match policy {
            LinkPolicy::PerSession => Upstream::PerSession(Arc::new(connector)),
            LinkPolicy::Pooled { size } => Upstream::Pooled(Arc::new(LinkPool::new(connector, size))),
        }
    }

    pub fn connector(&self) -> &UpstreamConnector {
        match self {
            Upstream::PerSession(connector) => connector,
            Upstream::Pooled(pool) => pool.connector(),
        }
    }

    /// Upstream access for the session with the given ID.
    pub fn session(&self, session: u64) -> SessionUpstream {
        match self {
            Upstream::PerSession(connector) => SessionUpstream::Owned {
                connector: connector.clone(),
                link: None,
            },
            Upstream::Pooled(pool) => SessionUpstream::Shared {
                pool: pool.clone(),
                session,
            },
        }
    }
}

/// A session's route to the upstream resolver.
pub enum SessionUpstream {
    Owned {
        connector: Arc<UpstreamConnector>,
        link: Option<UpstreamLink>,
    },
    Shared {
        pool: Arc<LinkPool>,
        session: u64,
    },
}

impl SessionUpstream {
    /// Forward `query` and return the matching response under the query's
    /// own transaction ID.
    pub async fn exchange(&mut self, query: Frame, timeout: Duration) -> Result<Frame, ForwardError> {
        match self {
            SessionUpstream::Owned { connector, link } => {
                exchange_on(connector, link, &query, timeout).await
            }
            SessionUpstream::Shared { pool, session } => {
                let original_id = query.id;
                let reservation = Reservation::new(
                    pool.ids(),
                    PendingQuery {
                        session: *session,
                        original_id,
                    },
                )
                .ok_or(ForwardError::IdsExhausted)?;

                let query = query.with_id(reservation.local_id);
                let response = {
                    let mut slot = tokio::time::timeout(timeout, pool.acquire())
                        .await
                        .map_err(|_| ForwardError::Timeout(timeout))?;
                    exchange_on(pool.connector(), &mut slot, &query, timeout).await?
                };

                let pending = reservation.finish();
                Ok(response.with_id(pending.map_or(original_id, |p| p.original_id)))
            }
        }
    }

    /// Drop any link owned exclusively by this session.
    pub fn close(&mut self) {
        if let SessionUpstream::Owned { link, .. } = self {
            link.take();
        }
    }
}

/// A local ID held in the correlation table until the exchange ends,
/// including when the exchange future is dropped.
struct Reservation<'a> {
    ids: &'a IdMap,
    local_id: u16,
    released: bool,
}

impl<'a> Reservation<'a> {
    fn new(ids: &'a IdMap, query: PendingQuery) -> Option<Self> {
        let local_id = ids.reserve(query)?;
        Some(Self {
            ids,
            local_id,
            released: false,
        })
    }

    fn finish(mut self) -> Option<PendingQuery> {
        self.released = true;
        self.ids.release(self.local_id)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.ids.release(self.local_id);
        }
    }
}

/// Run one exchange on the link in `slot`, dialing if it is empty.
///
/// A reused link that turns out to be closed by the upstream is replaced
/// and the query resent once. On any error the link is dropped.
async fn exchange_on(
    connector: &UpstreamConnector,
    slot: &mut Option<UpstreamLink>,
    query: &Frame,
    timeout: Duration,
) -> Result<Frame, ForwardError> {
    let idle_limit = connector.config().link_idle_timeout;
    if slot.as_ref().is_some_and(|link| link.idle_for() > idle_limit) {
        debug!("discarding idle upstream link");
        *slot = None;
    }

    loop {
        let mut link = match slot.take() {
            Some(link) => link,
            None => connector.connect().await?,
        };
        let reused = link.is_reused();

        match link.forward(query, timeout).await {
            Ok(response) if response.id == query.id => {
                *slot = Some(link);
                return Ok(response);
            }
            Ok(response) => {
                return Err(ForwardError::IdMismatch {
                    expected: query.id,
                    got: response.id,
                });
            }
            Err(e) if reused && e.is_stale_link() => {
                debug!(upstream = %link.peer(), error = %e, "stale upstream link, reconnecting");
            }
            Err(e) => return Err(e),
        }
    }
}
