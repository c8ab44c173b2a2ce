//! Error types for the forwarder.
//!
//! Everything except [`BindError`] and [`ConfigError`] is local to a single
//! client connection and only ever ends that connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors from decoding or encoding a length-prefixed frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream closed before a whole frame was delivered.
    #[error("stream closed in the middle of a frame")]
    Truncated,

    /// The length prefix cannot hold a transaction ID.
    #[error("frame length {0} is shorter than a transaction id")]
    Malformed(u16),

    /// The body does not fit the 16-bit length prefix.
    #[error("frame body of {0} bytes does not fit a 16-bit length prefix")]
    TooLarge(usize),

    /// The underlying stream failed for a reason other than EOF.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    }
}

/// Failure to establish a TLS session with the upstream resolver.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("TCP connect to {addr} failed: {source}")]
    Tcp {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Recent connects failed; the next attempt is held back.
    #[error("upstream unavailable, next attempt in {0:?}")]
    BackingOff(Duration),
}

/// Failure during one query/response exchange with the upstream.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("upstream connection reset: {0}")]
    ConnectionReset(#[source] io::Error),

    #[error("malformed upstream frame: {0}")]
    Malformed(#[source] FrameError),

    #[error("upstream answered id {got:#06x}, expected {expected:#06x}")]
    IdMismatch { expected: u16, got: u16 },

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("no free transaction id for upstream query")]
    IdsExhausted,
}

impl ForwardError {
    /// Whether the error means the upstream dropped a link that was
    /// previously healthy, so a resend on a fresh link is worthwhile.
    pub fn is_stale_link(&self) -> bool {
        matches!(
            self,
            ForwardError::ConnectionReset(_) | ForwardError::Malformed(FrameError::Truncated)
        )
    }
}

impl From<FrameError> for ForwardError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => ForwardError::ConnectionReset(e),
            FrameError::Truncated => ForwardError::Malformed(FrameError::Truncated),
            other => ForwardError::Malformed(other),
        }
    }
}

/// Failure to bind the listening socket. Fatal at startup.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("not enough privilege to listen on port {}", .0.port())]
    PermissionDenied(SocketAddr),

    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    #[error("cannot listen on {addr}: {source}")]
    Other {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub fn from_io(addr: SocketAddr, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied(addr),
            io::ErrorKind::AddrInUse => BindError::AddressInUse(addr),
            _ => BindError::Other { addr, source: e },
        }
    }
}

/// Invalid upstream TLS settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TLS server name {0:?}")]
    ServerName(String),

    #[error("cannot read CA file {path}: {source}")]
    CaFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("rejected CA certificate: {0}")]
    CaCertificate(#[source] rustls::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Startup failures of the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a forwarding session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("client frame: {0}")]
    Frame(#[source] FrameError),

    #[error("client idle for {0:?}")]
    Idle(Duration),

    #[error("forward failed: {0}")]
    Forward(#[from] ForwardError),

    #[error("writing reply to client: {0}")]
    Reply(#[source] FrameError),

    #[error("client did not accept the reply within {0:?}")]
    ReplyTimeout(Duration),
}
