//! # SOCKS Tunnel
//!
//! A two-hop encrypted tunneling proxy. The client process exposes a local
//! SOCKS5 endpoint and forwards every accepted connection, through an
//! authenticated and encrypted tunnel, to the server process, which resolves
//! the requested target and relays bytes to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ SOCKS5 ┌────────────────┐ tunnel  ┌────────────────┐  TCP  ┌────────┐
//! │   App    │───────▶│ tunnel-client  │════════▶│ tunnel-server  │──────▶│ Target │
//! └──────────┘        │ local/upstream │ frames  │ client/target  │       └────────┘
//!                     └────────────────┘         └────────────────┘
//! ```
//!
//! Both processes run the same engine:
//!
//! - **Reactor**: one acceptor thread plus N worker threads, each owning a
//!   readiness poller and a disjoint set of connections
//! - **Buffer pools**: shared free-lists of read, write and frame buffers
//! - **Protocol handlers**: per-process state machines driving the SOCKS5 and
//!   tunnel handshakes, then raw relay
//! - **Frame codec**: length-prefixed, CRC32-checked, stream-ciphered frames
//!   with reassembly across arbitrary TCP segmentation

pub mod client;
pub mod config;
pub mod console;
pub mod crypto;
pub mod protocol;
pub mod proxy;
pub mod reactor;
pub mod server;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port of the tunnel server
pub const DEFAULT_SERVER_PORT: u16 = 8388;

/// Default port of the local SOCKS5 endpoint
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Reactor error: {0}")]
    Reactor(#[from] reactor::ReactorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}
