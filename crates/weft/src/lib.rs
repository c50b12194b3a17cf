//! Peer connection layer for an overlay mesh network.
//!
//! weft multiplexes pluggable stream transports (plain TCP built in,
//! SOCKS5-tunnelled TCP, and anything else implementing [`Transport`])
//! behind one dial/listen façade. Every raw stream is wrapped in a short
//! handshake that exchanges a fixed 38-byte preamble carrying the
//! protocol version and the peer's Ed25519 public key, enforces the
//! configured access policy, and deduplicates simultaneous sessions to
//! the same peer so at most one survives.
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use weft::{ConnManager, ManagerConfig};
//!
//! # async fn example() -> Result<(), weft::WeftError> {
//! let manager = ConnManager::new(CancellationToken::new(), None, ManagerConfig::default());
//! let uri = url::Url::parse("tcp://peer.example.org:9443").expect("static uri");
//! let conn = manager.connect(&uri).await?;
//! let peer = conn.peer_key().await?;
//! println!("connected to {}", hex::encode(peer));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Dial-safety checks on target addresses.
pub mod addr;
/// Optional peer allow list.
pub mod allow;
/// The overlay connection and listener wrappers.
pub mod conn;
/// One-session-per-peer deduplication registry.
pub mod dedup;
/// The public error taxonomy.
pub mod error;
/// Node identity key handling.
pub mod identity;
/// The connection manager façade.
pub mod manager;
mod socks5;
/// The built-in TCP transport.
pub mod tcp;
/// Transport capability traits.
pub mod transport;

pub use allow::AllowList;
pub use conn::{ConnCloser, WeftConn, WeftListener, WrapOptions, HANDSHAKE_TIMEOUT};
pub use dedup::{DedupConfig, DeduplicationManager, DedupHandle};
pub use error::WeftError;
pub use identity::Identity;
pub use manager::{ConnManager, ManagerConfig};
pub use tcp::{TcpDialer, TcpDialerConfig, TcpTransport};
pub use transport::{default_transports, BoxRawStream, Dialed, RawStream, Transport, TransportListener};

pub use weft_wire as wire;
