use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use weft_wire::{fmt_key, PeerKey};

/// Session deduplication settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Resolve equal-security collisions by session nonce. When off, a
    /// newcomer at the same security level as the incumbent always
    /// loses, which avoids flapping between two equally good links.
    pub strict: bool,
    /// Delay in milliseconds before a displaced session's eviction
    /// callback fires, giving its in-flight reads time to drain. The
    /// registry slot itself transfers immediately.
    pub grace_ms: Option<u64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strict: true,
            grace_ms: None,
        }
    }
}

/// Random per-session identifier, generated at connection construction.
/// Breaks collisions between sessions at the same security level.
pub type SessionNonce = [u8; 16];

/// Generates a fresh session nonce.
pub(crate) fn new_nonce() -> SessionNonce {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

type EvictFn = Box<dyn FnOnce() + Send>;

struct Entry {
    secure_level: u8,
    nonce: SessionNonce,
    evict: EvictFn,
}

/// Process-wide registry admitting at most one live session per peer key.
///
/// Sessions claim their peer's slot with [`check`](Self::check) once the
/// peer key is known; the loser of any collision is told to close itself
/// and the winner holds a [`DedupHandle`] that frees the slot when the
/// session ends.
pub struct DeduplicationManager {
    config: DedupConfig,
    entries: Arc<Mutex<HashMap<PeerKey, Entry>>>,
}

impl DeduplicationManager {
    /// New registry with the given collision policy.
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claims the slot for `peer_key` on behalf of one session.
    ///
    /// Returns a release handle when the session wins the slot, `None`
    /// when it loses and must close itself with a deduplication error.
    /// A displaced incumbent's `on_evict` runs outside the registry
    /// lock, at most once per session.
    ///
    /// Collision rule: the higher `secure_level` wins; at equal levels
    /// the larger `nonce` wins in strict mode, and the newcomer loses
    /// otherwise.
    pub fn check(
        &self,
        peer_key: PeerKey,
        secure_level: u8,
        nonce: SessionNonce,
        on_evict: impl FnOnce() + Send + 'static,
    ) -> Option<DedupHandle> {
        let displaced: Option<EvictFn>;
        {
            let mut entries = self.lock_entries();
            match entries.get(&peer_key) {
                None => {
                    entries.insert(
                        peer_key,
                        Entry {
                            secure_level,
                            nonce,
                            evict: Box::new(on_evict),
                        },
                    );
                    displaced = None;
                }
                Some(incumbent) => {
                    let wins = if secure_level != incumbent.secure_level {
                        secure_level > incumbent.secure_level
                    } else if self.config.strict {
                        nonce > incumbent.nonce
                    } else {
                        false
                    };
                    if !wins {
                        debug!(peer = %fmt_key(&peer_key), "duplicate session rejected");
                        return None;
                    }
                    let old = entries.insert(
                        peer_key,
                        Entry {
                            secure_level,
                            nonce,
                            evict: Box::new(on_evict),
                        },
                    );
                    displaced = old.map(|entry| entry.evict);
                }
            }
        }
        if let Some(evict) = displaced {
            debug!(peer = %fmt_key(&peer_key), "incumbent session displaced");
            match self.config.grace_ms {
                Some(ms) if ms > 0 => {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        evict();
                    });
                }
                _ => evict(),
            }
        }
        Some(DedupHandle {
            entries: Arc::clone(&self.entries),
            peer_key,
            nonce,
            released: false,
        })
    }

    /// Number of peers currently holding a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no session currently holds a slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<PeerKey, Entry>> {
        lock(&self.entries)
    }
}

fn lock(entries: &Mutex<HashMap<PeerKey, Entry>>) -> MutexGuard<'_, HashMap<PeerKey, Entry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

/// Releases a claimed dedup slot when its session ends.
///
/// Release is keyed by the session nonce, so a handle left over from a
/// displaced session never frees the slot out from under its successor.
pub struct DedupHandle {
    entries: Arc<Mutex<HashMap<PeerKey, Entry>>>,
    peer_key: PeerKey,
    nonce: SessionNonce,
    released: bool,
}

impl DedupHandle {
    /// Frees the slot if this session still holds it.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            let mut entries = lock(&self.entries);
            if entries
                .get(&self.peer_key)
                .is_some_and(|e| e.nonce == self.nonce)
            {
                entries.remove(&self.peer_key);
            }
        }
    }
}

impl Drop for DedupHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_key(id: u8) -> PeerKey {
        let mut key = [0u8; 32];
        key[0] = id;
        key
    }

    fn nonce(id: u8) -> SessionNonce {
        let mut nonce = [0u8; 16];
        nonce[0] = id;
        nonce
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, hook)
    }

    #[test]
    fn first_session_is_admitted() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let (evictions, hook) = counter();
        let handle = manager.check(make_key(1), 0, nonce(1), hook);
        assert!(handle.is_some());
        assert_eq!(evictions.load(Ordering::SeqCst), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn distinct_peers_never_collide() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let mut handles = Vec::new();
        for id in 0..10 {
            for secure in 0..2 {
                let (_, hook) = counter();
                let handle = manager.check(make_key(id * 2 + secure), secure, nonce(id), hook);
                handles.push(handle.expect("no collision expected"));
            }
        }
        assert_eq!(manager.len(), 20);
    }

    #[test]
    fn higher_secure_level_displaces_the_incumbent() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let (first_evictions, first_hook) = counter();
        let (second_evictions, second_hook) = counter();

        let first = manager.check(make_key(1), 0, nonce(1), first_hook);
        assert!(first.is_some());
        let second = manager.check(make_key(1), 1, nonce(2), second_hook);
        assert!(second.is_some());

        assert_eq!(first_evictions.load(Ordering::SeqCst), 1);
        assert_eq!(second_evictions.load(Ordering::SeqCst), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn lower_secure_level_newcomer_is_rejected() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let (first_evictions, first_hook) = counter();
        let (_, second_hook) = counter();

        let first = manager.check(make_key(1), 1, nonce(1), first_hook);
        assert!(first.is_some());
        let second = manager.check(make_key(1), 0, nonce(2), second_hook);
        assert!(second.is_none());
        assert_eq!(first_evictions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn equal_level_strict_larger_nonce_wins() {
        for (first_nonce, second_nonce, second_wins) in
            [(nonce(1), nonce(2), true), (nonce(2), nonce(1), false)]
        {
            let manager = DeduplicationManager::new(DedupConfig::default());
            let (first_evictions, first_hook) = counter();
            let (_, second_hook) = counter();

            let first = manager.check(make_key(1), 0, first_nonce, first_hook);
            assert!(first.is_some());
            let second = manager.check(make_key(1), 0, second_nonce, second_hook);

            if second_wins {
                assert!(second.is_some());
                assert_eq!(first_evictions.load(Ordering::SeqCst), 1);
            } else {
                assert!(second.is_none());
                assert_eq!(first_evictions.load(Ordering::SeqCst), 0);
            }
        }
    }

    #[test]
    fn equal_level_non_strict_rejects_the_newcomer() {
        let config = DedupConfig {
            strict: false,
            grace_ms: None,
        };
        let manager = DeduplicationManager::new(config);
        let (first_evictions, first_hook) = counter();
        let (_, second_hook) = counter();

        let first = manager.check(make_key(1), 0, nonce(1), first_hook);
        assert!(first.is_some());
        // larger nonce would win under strict mode
        let second = manager.check(make_key(1), 0, nonce(2), second_hook);
        assert!(second.is_none());
        assert_eq!(first_evictions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn collision_matrix_under_strict_mode() {
        // (levels, expected loser: 1 = incumbent, 2 = newcomer), nonces
        // fixed so the newcomer wins equal-level ties
        for (first_level, second_level, loser) in [(0, 0, 1), (0, 1, 1), (1, 0, 2), (1, 1, 1)] {
            let manager = DeduplicationManager::new(DedupConfig::default());
            let (first_evictions, first_hook) = counter();
            let (second_evictions, second_hook) = counter();

            let first = manager.check(make_key(9), first_level, nonce(1), first_hook);
            assert!(first.is_some(), "incumbent must be admitted");
            let second = manager.check(make_key(9), second_level, nonce(2), second_hook);

            if loser == 1 {
                assert!(second.is_some(), "({first_level},{second_level})");
                assert_eq!(first_evictions.load(Ordering::SeqCst), 1);
                assert_eq!(second_evictions.load(Ordering::SeqCst), 0);
            } else {
                assert!(second.is_none(), "({first_level},{second_level})");
                assert_eq!(first_evictions.load(Ordering::SeqCst), 0);
                assert_eq!(second_evictions.load(Ordering::SeqCst), 0);
            }
        }
    }

    #[test]
    fn release_frees_the_slot() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let (_, hook) = counter();
        let handle = manager.check(make_key(1), 0, nonce(1), hook).unwrap();
        handle.release();
        assert!(manager.is_empty());

        let (_, hook) = counter();
        assert!(manager.check(make_key(1), 0, nonce(2), hook).is_some());
    }

    #[test]
    fn drop_releases_the_slot() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let (_, hook) = counter();
        {
            let _handle = manager.check(make_key(1), 0, nonce(1), hook).unwrap();
        }
        assert!(manager.is_empty());
    }

    #[test]
    fn stale_handle_does_not_free_the_successor() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let (_, first_hook) = counter();
        let (_, second_hook) = counter();

        let first = manager.check(make_key(1), 0, nonce(1), first_hook).unwrap();
        let _second = manager.check(make_key(1), 1, nonce(2), second_hook).unwrap();

        // the displaced session's teardown must not evict its successor
        first.release();
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn eviction_fires_exactly_once() {
        let manager = DeduplicationManager::new(DedupConfig::default());
        let (first_evictions, first_hook) = counter();
        let (_, second_hook) = counter();
        let (_, third_hook) = counter();

        let _first = manager.check(make_key(1), 0, nonce(1), first_hook);
        let _second = manager.check(make_key(1), 1, nonce(2), second_hook);
        let _third = manager.check(make_key(1), 2, nonce(3), third_hook);
        assert_eq!(first_evictions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn grace_defers_the_eviction_callback() {
        let config = DedupConfig {
            strict: true,
            grace_ms: Some(50),
        };
        let manager = DeduplicationManager::new(config);
        let (first_evictions, first_hook) = counter();
        let (_, second_hook) = counter();

        let _first = manager.check(make_key(1), 0, nonce(1), first_hook);
        let second = manager.check(make_key(1), 1, nonce(2), second_hook);
        assert!(second.is_some());

        assert_eq!(first_evictions.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(first_evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_defaults_to_strict_without_grace() {
        let config = DedupConfig::default();
        assert!(config.strict);
        assert!(config.grace_ms.is_none());
    }
}
