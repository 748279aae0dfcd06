//! Transparent TCP/TLS traffic forwarder.
//!
//! A [`Listener`] accepts client connections (optionally terminating TLS) and
//! runs one [`Session`] per connection. Each session lazily opens a single
//! upstream connection to the fixed target on its first chunk of data and
//! relays bytes in both directions through a [`Transform`].

pub mod config;
pub mod error;
pub mod proxy;
pub mod tls;

pub use config::{Args, Config, ListenerConfig, LogFormat, UpstreamConfig};
pub use error::{Error, Result};
pub use proxy::listener::Listener;
pub use proxy::session::{Session, SessionState};
pub use proxy::stats::ForwarderStats;
pub use proxy::transform::{Passthrough, Transform};
pub use proxy::upstream::Upstream;
