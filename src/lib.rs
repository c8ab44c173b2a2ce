//! dotfwd - forwards DNS-over-TCP clients to a DNS-over-TLS resolver.
//!
//! This library exposes the codec, transports and sessions for the binary,
//! benchmarks and tests.

pub mod error;
pub mod frame;
pub mod proxy;
pub mod session;
pub mod stats;
pub mod transport;

pub use error::{BindError, ConnectError, ForwardError, FrameError, ProxyError};
pub use frame::Frame;
pub use proxy::{Proxy, ProxyConfig};
