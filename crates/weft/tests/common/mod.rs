//! In-memory mock transport for driving the overlay stack end to end.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;
use weft::{Dialed, Transport, TransportListener, WeftError};
use weft_wire::{MetaPreamble, PeerKey, ProtoVersion, PROTO_VERSION};

/// Query parameters understood by the mock peer:
///
/// - `mock_transport_key`: hex key the peer announces (zero key default)
/// - `mock_version`: `major.minor` pair the peer announces
/// - `mock_delay_conn_ms`: delay before the dial completes
/// - `mock_delay_meta_ms`: delay before the peer sends its preamble
/// - `error=true`: listener accept fails
///
/// After its preamble the peer writes one info line (see
/// [`MockTransport::info_line`]) and then reads until the local side
/// hangs up, capturing everything into `written`.
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct MockInner {
    scheme: &'static str,
    secure_level: u8,
    written: Arc<Mutex<Vec<u8>>>,
}

impl MockTransport {
    pub fn new(scheme: &'static str, secure_level: u8) -> Self {
        Self {
            inner: Arc::new(MockInner {
                scheme,
                secure_level,
                written: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Everything the local side wrote on the most recent stream.
    pub fn written(&self) -> Vec<u8> {
        self.inner.written.lock().unwrap().clone()
    }

    /// The info line the fabricated peer writes after its preamble.
    pub fn info_line(scheme: &str, uri: &Url, proxy: Option<&Url>) -> String {
        let proxy = proxy.map_or_else(|| "none".to_string(), Url::to_string);
        format!("scheme={scheme};uri={uri};proxy={proxy}")
    }
}

impl MockInner {
    async fn open(&self, uri: &Url, proxy: Option<&Url>) -> Result<Dialed, WeftError> {
        let delay_conn = query_delay(uri, "mock_delay_conn_ms");
        if !delay_conn.is_zero() {
            tokio::time::sleep(delay_conn).await;
        }

        let peer_key = query_key(uri);
        let version = query_version(uri);
        let delay_meta = query_delay(uri, "mock_delay_meta_ms");
        let info = MockTransport::info_line(self.scheme, uri, proxy);
        let written = Arc::clone(&self.written);
        written.lock().unwrap().clear();

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut peer_rd, mut peer_wr) = tokio::io::split(theirs);
            let capture = tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match peer_rd.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => written.lock().unwrap().extend_from_slice(&buf[..n]),
                    }
                }
            });
            if !delay_meta.is_zero() {
                tokio::time::sleep(delay_meta).await;
            }
            let mut preamble = MetaPreamble::new(peer_key).encode();
            preamble[4] = version.major;
            preamble[5] = version.minor;
            let _ = peer_wr.write_all(&preamble).await;
            let _ = peer_wr.write_all(info.as_bytes()).await;
            let _ = capture.await;
        });

        Ok(Dialed {
            stream: Box::new(ours),
            claimed_peer_key: None,
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn scheme(&self) -> &str {
        self.inner.scheme
    }

    fn secure_level(&self) -> u8 {
        self.inner.secure_level
    }

    async fn connect(
        &self,
        _cancel: &CancellationToken,
        uri: &Url,
        proxy: Option<&Url>,
        _key: Option<&SigningKey>,
    ) -> Result<Dialed, WeftError> {
        self.inner.open(uri, proxy).await
    }

    async fn listen(
        &self,
        uri: &Url,
        _key: Option<&SigningKey>,
    ) -> Result<Box<dyn TransportListener>, WeftError> {
        Ok(Box::new(MockListener {
            inner: Arc::clone(&self.inner),
            uri: uri.clone(),
        }))
    }
}

struct MockListener {
    inner: Arc<MockInner>,
    uri: Url,
}

#[async_trait]
impl TransportListener for MockListener {
    async fn accept(&mut self) -> Result<Dialed, WeftError> {
        if query_param(&self.uri, "error").as_deref() == Some("true") {
            return Err(WeftError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock accept failure",
            )));
        }
        self.inner.open(&self.uri, None).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

fn query_param(uri: &Url, name: &str) -> Option<String> {
    for (key, value) in uri.query_pairs() {
        if key == name {
            return Some(value.into_owned());
        }
    }
    None
}

fn query_delay(uri: &Url, name: &str) -> Duration {
    query_param(uri, name)
        .and_then(|value| value.parse().ok())
        .map_or(Duration::ZERO, Duration::from_millis)
}

fn query_key(uri: &Url) -> PeerKey {
    query_param(uri, "mock_transport_key")
        .and_then(|value| hex::decode(value).ok())
        .and_then(|bytes| PeerKey::try_from(bytes).ok())
        .unwrap_or([0u8; 32])
}

fn query_version(uri: &Url) -> ProtoVersion {
    query_param(uri, "mock_version")
        .and_then(|value| {
            let (major, minor) = value.split_once('.')?;
            Some(ProtoVersion {
                major: major.parse().ok()?,
                minor: minor.parse().ok()?,
            })
        })
        .unwrap_or(PROTO_VERSION)
}

/// Fresh random peer key for tests.
pub fn random_key() -> PeerKey {
    use rand::RngCore;
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}
