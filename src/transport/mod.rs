//! Transport layer for the forwarder.
//!
//! Plain TCP towards clients, TLS towards the upstream resolver. Both sides
//! carry the same length-prefixed frames.

pub mod pool;
pub mod tcp;
pub mod tls;
pub mod upstream;

pub use tcp::TcpTransport;
pub use tls::{UpstreamConfig, UpstreamConnector, UpstreamLink, Verification};
pub use upstream::{LinkPolicy, SessionUpstream, Upstream};
