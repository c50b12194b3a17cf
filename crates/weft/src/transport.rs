use crate::error::WeftError;
use crate::tcp::{TcpDialer, TcpDialerConfig, TcpTransport};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use url::Url;
use weft_wire::PeerKey;

/// A bidirectional byte stream produced by a transport.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Local socket address, when the stream has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote socket address, when the stream has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Owned, type-erased raw stream.
pub type BoxRawStream = Box<dyn RawStream>;

impl RawStream for tokio::net::TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self).ok()
    }
}

// In-memory pipes carry no socket addresses; they back in-process
// transports and the test suite.
impl RawStream for tokio::io::DuplexStream {}

/// A raw connection handed back by [`Transport::connect`] or
/// [`TransportListener::accept`].
pub struct Dialed {
    /// The raw byte stream.
    pub stream: BoxRawStream,
    /// Peer key the transport learned out of band (for example from a
    /// pinned certificate). When present, the overlay handshake
    /// cross-checks it against the key the peer announces.
    pub claimed_peer_key: Option<PeerKey>,
}

/// A dial/listen capability for one URI scheme.
///
/// Transports are selected at runtime by the scheme of the dialed URI;
/// the manager keeps one registration per scheme.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Lowercase URI scheme this transport serves.
    fn scheme(&self) -> &str;

    /// Zero when the transport does not itself authenticate the peer,
    /// non-zero when it cryptographically pins the peer identity (for
    /// example TLS with a pinned certificate). Used as the primary
    /// tie-breaker when deduplicating sessions.
    fn secure_level(&self) -> u8;

    /// Opens a raw connection to `uri`, optionally through `proxy`.
    ///
    /// Cancelling `cancel` aborts the dial with [`WeftError::Cancelled`].
    async fn connect(
        &self,
        cancel: &CancellationToken,
        uri: &Url,
        proxy: Option<&Url>,
        key: Option<&SigningKey>,
    ) -> Result<Dialed, WeftError>;

    /// Binds a listener for `uri`.
    async fn listen(
        &self,
        uri: &Url,
        key: Option<&SigningKey>,
    ) -> Result<Box<dyn TransportListener>, WeftError>;
}

/// Accept side of a [`Transport`]. Dropping the listener closes it.
#[async_trait]
pub trait TransportListener: Send {
    /// Waits for the next inbound raw connection.
    async fn accept(&mut self) -> Result<Dialed, WeftError>;

    /// Bound local address, when there is one.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// The built-in transport set: plain TCP.
#[must_use]
pub fn default_transports(tcp: TcpDialerConfig) -> Vec<Arc<dyn Transport>> {
    vec![Arc::new(TcpTransport::new(TcpDialer::new(tcp)))]
}
