use crate::addr::AddrError;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use weft_wire::{fmt_key, PeerKey};

/// Errors surfaced by the weft connection stack.
///
/// The enum is the public error surface: callers match on the variant,
/// never on message text. A connection stores its first fatal error and
/// replays a clone of it from every later operation, which is why the
/// whole taxonomy is `Clone` (I/O errors are held behind an `Arc`).
#[derive(Debug, Error, Clone)]
pub enum WeftError {
    /// No transport is registered for the URI scheme.
    #[error("no transport registered for scheme `{0}`")]
    UnknownScheme(String),
    /// The peer's preamble was malformed or announced an unsupported
    /// version.
    #[error(transparent)]
    Preamble(#[from] weft_wire::PreambleError),
    /// A dial, handshake, or caller-supplied deadline elapsed.
    #[error("connection timed out")]
    ConnTimeout,
    /// The key pinned by the transport (or the `key=` query parameter)
    /// disagrees with the key the peer announced in its preamble.
    #[error(
        "transport security check failed: expected {}, received {}",
        fmt_key(.expected),
        fmt_key(.received)
    )]
    TransportSecurityCheck {
        /// Key the session was pinned to.
        expected: PeerKey,
        /// Key the peer actually announced.
        received: PeerKey,
    },
    /// The peer key was rejected by policy.
    #[error("invalid peer public key: {reason}")]
    InvalidPeerKey {
        /// Which policy rejected the key.
        reason: &'static str,
    },
    /// This session lost to another session with the same peer.
    #[error("connection closed by deduplicator")]
    ClosedByDeduplicator,
    /// The target or proxy address failed the dial-safety policy.
    #[error(transparent)]
    Addr(#[from] AddrError),
    /// Host resolution failed or produced no usable address.
    #[error("failed to resolve {0}")]
    Dns(String),
    /// SOCKS5 negotiation failed.
    #[error("socks5: {0}")]
    Socks(String),
    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// Underlying I/O error, passed through unchanged.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for WeftError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<WeftError> for io::Error {
    fn from(err: WeftError) -> Self {
        let kind = match &err {
            WeftError::ConnTimeout => io::ErrorKind::TimedOut,
            WeftError::Cancelled | WeftError::ClosedByDeduplicator => {
                io::ErrorKind::ConnectionAborted
            }
            WeftError::TransportSecurityCheck { .. } | WeftError::InvalidPeerKey { .. } => {
                io::ErrorKind::PermissionDenied
            }
            WeftError::Preamble(_) => io::ErrorKind::InvalidData,
            WeftError::UnknownScheme(_) | WeftError::Dns(_) => io::ErrorKind::InvalidInput,
            WeftError::Addr(_) | WeftError::Socks(_) => io::ErrorKind::ConnectionRefused,
            WeftError::Io(inner) => inner.kind(),
        };
        io::Error::new(kind, err)
    }
}

impl WeftError {
    /// Recovers the typed error from an `io::Error` produced by a weft
    /// stream, if there is one behind it.
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<&WeftError> {
        err.get_ref().and_then(|inner| inner.downcast_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_wire::PreambleError;

    #[test]
    fn io_round_trip_preserves_the_variant() {
        let err: io::Error = WeftError::ClosedByDeduplicator.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(matches!(
            WeftError::from_io(&err),
            Some(WeftError::ClosedByDeduplicator)
        ));
    }

    #[test]
    fn timeout_maps_to_timed_out() {
        let err: io::Error = WeftError::ConnTimeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn preamble_errors_nest_transparently() {
        let err = WeftError::from(PreambleError::UnknownProtocol);
        assert_eq!(err.to_string(), "peer is not speaking the overlay protocol");
    }

    #[test]
    fn terminal_errors_clone() {
        let err = WeftError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let replay = err.clone();
        assert!(matches!(replay, WeftError::Io(_)));
    }
}
