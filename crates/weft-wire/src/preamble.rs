//! Meta preamble serialization and parsing.
//!
//! Every overlay stream opens, in both directions, with a fixed 38-byte
//! preamble before any application byte: the ASCII header `meta`, the
//! protocol version pair, and the sender's public key. There is no length
//! prefix and no padding; every field is a single byte or a raw byte run.

use crate::types::{PeerKey, ProtoVersion, PEER_KEY_LEN, PROTO_VERSION};
use thiserror::Error;

/// ASCII header opening every overlay stream.
pub const META_HEADER: [u8; 4] = *b"meta";

/// Total preamble length: header, version pair, peer key.
pub const PREAMBLE_LEN: usize = 4 + 2 + PEER_KEY_LEN;

/// Errors that can occur while parsing a meta preamble.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PreambleError {
    /// The stream did not open with the `meta` header.
    #[error("peer is not speaking the overlay protocol")]
    UnknownProtocol,
    /// The header matched but the announced version is unsupported.
    #[error("unsupported protocol version: expected {expected}, received {received}")]
    UnsupportedVersion {
        /// Version this implementation speaks.
        expected: ProtoVersion,
        /// Version the peer announced.
        received: ProtoVersion,
    },
}

/// A decoded meta preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPreamble {
    /// Protocol version the sender announced.
    pub version: ProtoVersion,
    /// Public key the sender claims as its identity.
    pub peer_key: PeerKey,
}

impl MetaPreamble {
    /// Preamble announcing `peer_key` at the current protocol version.
    #[must_use]
    pub const fn new(peer_key: PeerKey) -> Self {
        Self {
            version: PROTO_VERSION,
            peer_key,
        }
    }

    /// Encodes to the fixed wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; PREAMBLE_LEN] {
        let mut buf = [0u8; PREAMBLE_LEN];
        buf[..4].copy_from_slice(&META_HEADER);
        buf[4] = self.version.major;
        buf[5] = self.version.minor;
        buf[6..].copy_from_slice(&self.peer_key);
        buf
    }

    /// Decodes the fixed wire form.
    ///
    /// The version pair is validated against [`PROTO_VERSION`]; the peer
    /// key is taken as claimed and not verified here.
    ///
    /// # Errors
    ///
    /// Returns [`PreambleError::UnknownProtocol`] on a header mismatch and
    /// [`PreambleError::UnsupportedVersion`] on a version mismatch.
    pub fn parse(buf: &[u8; PREAMBLE_LEN]) -> Result<Self, PreambleError> {
        if buf[..4] != META_HEADER {
            return Err(PreambleError::UnknownProtocol);
        }
        let version = ProtoVersion {
            major: buf[4],
            minor: buf[5],
        };
        if version != PROTO_VERSION {
            return Err(PreambleError::UnsupportedVersion {
                expected: PROTO_VERSION,
                received: version,
            });
        }
        let mut peer_key: PeerKey = [0; PEER_KEY_LEN];
        peer_key.copy_from_slice(&buf[6..]);
        Ok(Self { version, peer_key })
    }
}
