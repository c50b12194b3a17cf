use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::sync::OnceLock;
use weft_wire::PeerKey;

/// The node's long-term Ed25519 identity.
///
/// A manager constructed without a key materialises a random one the
/// first time it is needed and keeps it for the manager's lifetime: once
/// any connection has been produced, the identity is frozen.
pub enum Identity {
    /// Caller-supplied long-term key.
    Fixed(SigningKey),
    /// Lazily generated key, frozen after first use.
    Ephemeral(OnceLock<SigningKey>),
}

impl Identity {
    /// Wraps an optional caller key.
    #[must_use]
    pub fn from_optional(key: Option<SigningKey>) -> Self {
        match key {
            Some(key) => Self::Fixed(key),
            None => Self::Ephemeral(OnceLock::new()),
        }
    }

    /// The signing key, generating and caching one on first use.
    pub fn materialise(&self) -> &SigningKey {
        match self {
            Self::Fixed(key) => key,
            Self::Ephemeral(cell) => cell.get_or_init(|| SigningKey::generate(&mut OsRng)),
        }
    }

    /// Public half of the materialised key.
    #[must_use]
    pub fn public(&self) -> PeerKey {
        self.materialise().verifying_key().to_bytes()
    }
}
