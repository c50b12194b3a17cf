use crate::allow::AllowList;
use crate::conn::{WeftConn, WeftListener, WrapOptions, HANDSHAKE_TIMEOUT};
use crate::dedup::{DedupConfig, DeduplicationManager};
use crate::error::WeftError;
use crate::identity::Identity;
use crate::tcp::TcpDialerConfig;
use crate::transport::{default_transports, Transport};
use ed25519_dalek::SigningKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use weft_wire::{fmt_key, MetaPreamble, PeerKey};

/// Query parameter that pins the expected peer key and bypasses the
/// allow list for one session.
const KEY_QUERY_PARAM: &str = "key";

/// Connection manager settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// SOCKS5 proxy applied to every outbound dial.
    pub proxy: Option<Url>,
    /// Peers permitted to connect (`None` admits all; an empty list
    /// admits none).
    pub allow_list: Option<AllowList>,
    /// Session deduplication settings.
    pub dedup: DedupConfig,
    /// Settings for the built-in TCP transport.
    pub tcp: TcpDialerConfig,
}

/// The dial/listen façade of the overlay.
///
/// Maps URI schemes to registered transports, owns the node identity,
/// and wraps every raw stream — dialed or accepted — in the overlay
/// handshake with this manager's allow list and dedup registry.
pub struct ConnManager {
    transports: HashMap<String, Arc<dyn Transport>>,
    identity: Identity,
    proxy: Option<Url>,
    allow_list: Option<Arc<AllowList>>,
    dedup: Arc<DeduplicationManager>,
    cancel: CancellationToken,
}

impl ConnManager {
    /// Manager with the default transport set (TCP).
    ///
    /// When `key` is `None`, a random identity is generated on first use
    /// and kept for the manager's lifetime.
    #[must_use]
    pub fn new(cancel: CancellationToken, key: Option<SigningKey>, config: ManagerConfig) -> Self {
        let transports = default_transports(config.tcp.clone());
        Self::with_transports(cancel, key, config, transports)
    }

    /// Manager with an explicit transport set. Registration is by
    /// lowercase scheme; a transport registered later replaces an
    /// earlier one with the same scheme.
    #[must_use]
    pub fn with_transports(
        cancel: CancellationToken,
        key: Option<SigningKey>,
        config: ManagerConfig,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        let mut map = HashMap::new();
        for transport in transports {
            map.insert(transport.scheme().to_ascii_lowercase(), transport);
        }
        Self {
            transports: map,
            identity: Identity::from_optional(key),
            proxy: config.proxy,
            allow_list: config.allow_list.map(Arc::new),
            dedup: Arc::new(DeduplicationManager::new(config.dedup)),
            cancel,
        }
    }

    /// Schemes this manager can dial and listen on.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.transports.keys().map(String::as_str)
    }

    /// This manager's public identity key, materialising it if needed.
    #[must_use]
    pub fn public_key(&self) -> PeerKey {
        self.identity.public()
    }

    /// Opens an overlay connection to `uri`.
    ///
    /// Returns as soon as the raw stream is up and our own preamble is
    /// written; the peer's preamble is handled by a background handshake
    /// whose outcome is observed on the first read (or through
    /// [`WeftConn::peer_key`]).
    ///
    /// A `key=<64 hex chars>` query parameter pins the expected peer key
    /// and bypasses the allow list for this session.
    ///
    /// # Errors
    ///
    /// Fails with [`WeftError::UnknownScheme`] for an unregistered
    /// scheme; transport errors are propagated verbatim.
    pub async fn connect(&self, uri: &Url) -> Result<WeftConn, WeftError> {
        let transport = self.transport_for(uri)?;
        let identity = self.identity.materialise().clone();
        let pinned = pinned_key(uri)?;

        let dialed = transport
            .connect(&self.cancel, uri, self.proxy.as_ref(), Some(&identity))
            .await?;

        // a pinned key means the caller took responsibility for this
        // session: the allow list does not apply
        let (claimed_peer_key, allow_list) = match pinned {
            Some(key) => (Some(key), None),
            None => (dialed.claimed_peer_key, self.allow_list.clone()),
        };

        let mut stream = dialed.stream;
        let own_key = identity.verifying_key().to_bytes();
        stream.write_all(&MetaPreamble::new(own_key).encode()).await?;
        debug!(
            scheme = %uri.scheme(),
            key = %fmt_key(&own_key),
            "outbound overlay stream established"
        );

        Ok(WeftConn::wrap(
            stream,
            WrapOptions {
                claimed_peer_key,
                allow_list,
                secure_level: transport.secure_level(),
                dedup: Some(Arc::clone(&self.dedup)),
                cancel: self.cancel.clone(),
                handshake_timeout: HANDSHAKE_TIMEOUT,
            },
        ))
    }

    /// Like [`connect`](Self::connect), but bounds the whole dial plus
    /// preamble exchange by `timeout`. On expiry the connection is torn
    /// down and [`WeftError::ConnTimeout`] is returned; a handshake
    /// failure inside the window returns that failure instead.
    pub async fn connect_timeout(
        &self,
        uri: &Url,
        timeout: Duration,
    ) -> Result<WeftConn, WeftError> {
        tokio::time::timeout(timeout, async {
            let conn = self.connect(uri).await?;
            conn.wait_ready().await?;
            Ok(conn)
        })
        .await
        .map_err(|_| WeftError::ConnTimeout)?
    }

    /// Binds an overlay listener on `uri`, wired with this manager's
    /// allow list, the transport's secure level, and the shared dedup
    /// registry.
    ///
    /// # Errors
    ///
    /// Fails with [`WeftError::UnknownScheme`] for an unregistered
    /// scheme; transport errors are propagated verbatim.
    pub async fn listen(&self, uri: &Url) -> Result<WeftListener, WeftError> {
        let transport = self.transport_for(uri)?;
        let identity = self.identity.materialise();
        let inner = transport.listen(uri, Some(identity)).await?;
        info!(scheme = %uri.scheme(), addr = ?inner.local_addr(), "listening");
        Ok(WeftListener::new(
            inner,
            identity.verifying_key().to_bytes(),
            self.allow_list.clone(),
            transport.secure_level(),
            Some(Arc::clone(&self.dedup)),
            self.cancel.clone(),
        ))
    }

    fn transport_for(&self, uri: &Url) -> Result<&Arc<dyn Transport>, WeftError> {
        self.transports
            .get(&uri.scheme().to_ascii_lowercase())
            .ok_or_else(|| WeftError::UnknownScheme(uri.scheme().to_string()))
    }
}

/// Extracts and validates the `key=` query parameter.
fn pinned_key(uri: &Url) -> Result<Option<PeerKey>, WeftError> {
    for (name, value) in uri.query_pairs() {
        if name == KEY_QUERY_PARAM {
            let bytes = hex::decode(value.as_bytes()).map_err(|_| WeftError::InvalidPeerKey {
                reason: "key query parameter is not valid hex",
            })?;
            let key: PeerKey = bytes.try_into().map_err(|_| WeftError::InvalidPeerKey {
                reason: "key query parameter must be 32 hex bytes",
            })?;
            return Ok(Some(key));
        }
    }
    Ok(None)
}
