use serde::{Deserialize, Deserializer};
use subtle::{Choice, ConstantTimeEq};
use weft_wire::{PeerKey, PEER_KEY_LEN};

/// Set of peer public keys permitted to complete a handshake.
///
/// Call sites take `Option<&AllowList>`: `None` admits every peer, while
/// a present but empty list admits none. Membership is constant-time
/// byte equality: every listed key is compared in full, with no early
/// exit on a match.
///
/// In configuration files the list is written as a sequence of 64-char
/// hex strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    keys: Vec<PeerKey>,
}

impl AllowList {
    /// Empty list (rejects every peer).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is in the list.
    ///
    /// Scans the whole list and compares each candidate with
    /// [`ConstantTimeEq`], so the running time does not depend on which
    /// key matched or where it sits in the list.
    #[must_use]
    pub fn contains(&self, key: &PeerKey) -> bool {
        let mut found = Choice::from(0u8);
        for candidate in &self.keys {
            found |= candidate[..].ct_eq(&key[..]);
        }
        found.into()
    }

    /// Adds a key to the list.
    pub fn insert(&mut self, key: PeerKey) {
        if !self.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Number of keys in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<PeerKey> for AllowList {
    fn from_iter<I: IntoIterator<Item = PeerKey>>(iter: I) -> Self {
        let mut list = Self::new();
        for key in iter {
            list.insert(key);
        }
        list
    }
}

impl<'de> Deserialize<'de> for AllowList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        let mut list = Self::new();
        for s in &strings {
            let bytes = hex::decode(s)
                .map_err(|e| serde::de::Error::custom(format!("peer key `{s}`: {e}")))?;
            let key: PeerKey = bytes.try_into().map_err(|_| {
                serde::de::Error::custom(format!("peer key `{s}` must be {PEER_KEY_LEN} bytes"))
            })?;
            list.insert(key);
        }
        Ok(list)
    }
}
