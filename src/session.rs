//! Per-client forwarding session.
//!
//! A session is a strict loop: read one frame from the client, forward it
//! upstream, write the answer back, repeat. Responses therefore leave in
//! the order queries arrived. Any error closes the client connection; the
//! client sees a closed socket instead of a synthesized answer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::error::SessionError;
use crate::frame::{Frame, read_frame, write_frame};
use crate::stats::Stats;
use crate::transport::SessionUpstream;

/// Deadlines applied by a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Longest wait for the next client frame. Re-armed after every frame.
    pub idle: Duration,
    /// Bound on the upstream write, the upstream read and the client reply.
    pub request: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(2),
            request: Duration::from_secs(2),
        }
    }
}

enum State {
    Reading,
    Dispatching(Frame),
    Replying(Frame),
    Closed(Option<SessionError>),
}

/// State for one accepted client connection.
pub struct ClientSession {
    id: u64,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    upstream: SessionUpstream,
    in_flight: FxHashSet<u16>,
    timeouts: SessionTimeouts,
    stats: Arc<Stats>,
}

impl ClientSession {
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        upstream: SessionUpstream,
        timeouts: SessionTimeouts,
        stats: Arc<Stats>,
    ) -> Self {
        let (read_half, writer) = stream.into_split();

        Self {
            id,
            peer,
            reader: BufReader::new(read_half),
            writer,
            upstream,
            in_flight: FxHashSet::default(),
            timeouts,
            stats,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Serve the client until it disconnects or something fails.
    ///
    /// `Ok(())` means the client closed the connection between frames.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut state = State::Reading;

        loop {
            state = match state {
                State::Reading => self.read_query().await,
                State::Dispatching(query) => self.dispatch(query).await,
                State::Replying(response) => self.reply(response).await,
                State::Closed(reason) => {
                    self.close().await;
                    return reason.map_or(Ok(()), Err);
                }
            };
        }
    }

    async fn read_query(&mut self) -> State {
        let idle = self.timeouts.idle;

        match tokio::time::timeout(idle, read_frame(&mut self.reader)).await {
            Ok(Ok(Some(query))) => {
                debug!(id = query.id, len = query.wire_len(), "query from client");
                self.in_flight.insert(query.id);
                State::Dispatching(query)
            }
            Ok(Ok(None)) => State::Closed(None),
            Ok(Err(e)) => State::Closed(Some(SessionError::Frame(e))),
            Err(_) => State::Closed(Some(SessionError::Idle(idle))),
        }
    }

    async fn dispatch(&mut self, query: Frame) -> State {
        let id = query.id;
        let started = Instant::now();

        match self.upstream.exchange(query, self.timeouts.request).await {
            Ok(response) => {
                self.in_flight.remove(&id);
                let upstream_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.stats.record_forwarded(upstream_ms);
                debug!(id, len = response.wire_len(), upstream_ms, "answer from upstream");
                State::Replying(response)
            }
            Err(e) => {
                self.stats.record_failed();
                State::Closed(Some(e.into()))
            }
        }
    }

    async fn reply(&mut self, response: Frame) -> State {
        let limit = self.timeouts.request;

        match tokio::time::timeout(limit, write_frame(&mut self.writer, &response)).await {
            Ok(Ok(())) => State::Reading,
            Ok(Err(e)) => State::Closed(Some(SessionError::Reply(e))),
            Err(_) => State::Closed(Some(SessionError::ReplyTimeout(limit))),
        }
    }

    async fn close(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(ids = ?self.in_flight, "abandoning queries in flight");
            self.in_flight.clear();
        }
        self.upstream.close();
        let _ = self.writer.shutdown().await;
    }
}
