//! Peer identity and protocol version types.

use std::fmt;

/// A 32-byte Ed25519 public key identifying a mesh peer.
pub type PeerKey = [u8; 32];

/// Byte length of a [`PeerKey`].
pub const PEER_KEY_LEN: usize = 32;

/// Protocol version pair announced in the meta preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtoVersion {
    /// Major version byte.
    pub major: u8,
    /// Minor version byte.
    pub minor: u8,
}

/// The protocol version this implementation speaks.
pub const PROTO_VERSION: ProtoVersion = ProtoVersion { major: 0, minor: 4 };

impl fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Short hex form of a peer key for log lines.
#[must_use]
pub fn fmt_key(key: &PeerKey) -> String {
    hex::encode(&key[..4])
}
