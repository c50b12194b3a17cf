use crate::allow::AllowList;
use crate::dedup::{new_nonce, DeduplicationManager, DedupHandle, SessionNonce};
use crate::error::WeftError;
use crate::transport::{BoxRawStream, TransportListener};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace, warn};
use weft_wire::{fmt_key, MetaPreamble, PeerKey, ProtoVersion, PREAMBLE_LEN};

/// Deadline for the peer's preamble to arrive on a new stream.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the handshake learned from the peer's preamble. The version can
/// be known even when the handshake failed (version mismatch); the key
/// is only known on a full parse.
#[derive(Debug, Clone, Copy)]
struct Meta {
    version: Option<ProtoVersion>,
    peer_key: Option<PeerKey>,
}

/// State shared between a conn, its handshake task, its closer handles,
/// and the dedup registry's eviction callback.
struct Shared {
    /// First fatal error; replayed by every later operation.
    error: OnceLock<WeftError>,
    /// Cancelled on close, eviction, or manager shutdown.
    cancel: CancellationToken,
    /// Slot held in the dedup registry while this session is the winner.
    dedup_slot: Mutex<Option<DedupHandle>>,
}

impl Shared {
    /// Stamps the terminal error (first one wins) and tears the conn
    /// down: the dedup slot is freed and every pending I/O wakes.
    fn fail(&self, err: WeftError) {
        let _ = self.error.set(err);
        self.release_dedup();
        self.cancel.cancel();
    }

    fn release_dedup(&self) {
        let handle = self
            .dedup_slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.release();
        }
    }

    fn store_dedup(&self, handle: DedupHandle) {
        *self.dedup_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn terminal_error(&self) -> WeftError {
        self.error.get().cloned().unwrap_or_else(|| {
            WeftError::Io(Arc::new(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )))
        })
    }
}

/// Inputs for wrapping a raw stream into a [`WeftConn`].
pub struct WrapOptions {
    /// Peer key pinned out of band; cross-checked against the preamble.
    pub claimed_peer_key: Option<PeerKey>,
    /// Allow list applied to the preamble key (`None` admits all).
    pub allow_list: Option<Arc<AllowList>>,
    /// Secure level of the transport that produced the stream.
    pub secure_level: u8,
    /// Session registry; `None` disables deduplication.
    pub dedup: Option<Arc<DeduplicationManager>>,
    /// Parent cancellation token; a child token guards this conn.
    pub cancel: CancellationToken,
    /// Deadline for the peer's preamble.
    pub handshake_timeout: Duration,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            claimed_peer_key: None,
            allow_list: None,
            secure_level: 0,
            dedup: None,
            cancel: CancellationToken::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

enum ReadState {
    /// The handshake task still owns the read half.
    Waiting(oneshot::Receiver<(ReadHalf<BoxRawStream>, Vec<u8>)>),
    /// Handshake done; leftover bytes drain before the stream itself.
    Ready {
        inner: ReadHalf<BoxRawStream>,
        leftover: Vec<u8>,
    },
    /// The handshake never handed the read half back.
    Failed,
}

/// An overlay connection: a raw stream decorated with the preamble
/// handshake, access policy, and session deduplication.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. Reads never yield
/// preamble bytes: the first read blocks until the background handshake
/// settles, then byte 0 of the application payload is the first byte
/// returned. Writes pass through from the start. After any fatal
/// handshake error, every operation returns that stored error.
///
/// One task reads at a time; closing is safe from any task through a
/// [`ConnCloser`].
pub struct WeftConn {
    shared: Arc<Shared>,
    write: WriteHalf<BoxRawStream>,
    read_state: ReadState,
    meta_rx: watch::Receiver<Option<Meta>>,
    ready_rx: watch::Receiver<bool>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl fmt::Debug for WeftConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeftConn")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl WeftConn {
    /// Wraps `stream`, spawning the handshake in the background.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn wrap(stream: BoxRawStream, opts: WrapOptions) -> Self {
        let local_addr = stream.local_addr();
        let peer_addr = stream.peer_addr();
        let cancel = opts.cancel.child_token();
        let shared = Arc::new(Shared {
            error: OnceLock::new(),
            cancel: cancel.clone(),
            dedup_slot: Mutex::new(None),
        });

        let (meta_tx, meta_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let (read_half, write_half) = tokio::io::split(stream);

        let ctx = HandshakeCtx {
            shared: Arc::clone(&shared),
            claimed_key: opts.claimed_peer_key,
            allow_list: opts.allow_list,
            secure_level: opts.secure_level,
            dedup: opts.dedup,
            nonce: new_nonce(),
            timeout: opts.handshake_timeout,
            meta_tx,
            ready_tx,
        };
        tokio::spawn(handshake(read_half, ctx, handoff_tx));

        Self {
            cancelled: Box::pin(cancel.cancelled_owned()),
            shared,
            write: write_half,
            read_state: ReadState::Waiting(handoff_rx),
            meta_rx,
            ready_rx,
            local_addr,
            peer_addr,
        }
    }

    /// Protocol version the peer announced.
    ///
    /// Blocks until the preamble is parsed, then answers from cache. A
    /// version-mismatch failure still reports the received version here;
    /// when no version was ever read, returns the terminal error.
    pub async fn version(&self) -> Result<ProtoVersion, WeftError> {
        let meta = self.wait_meta().await?;
        meta.version.ok_or_else(|| self.shared.terminal_error())
    }

    /// Public key the peer announced in its preamble.
    ///
    /// Blocks until the preamble is parsed, then answers from cache.
    pub async fn peer_key(&self) -> Result<PeerKey, WeftError> {
        let meta = self.wait_meta().await?;
        meta.peer_key.ok_or_else(|| self.shared.terminal_error())
    }

    async fn wait_meta(&self) -> Result<Meta, WeftError> {
        let mut rx = self.meta_rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(guard) => Ok(guard.unwrap_or(Meta {
                version: None,
                peer_key: None,
            })),
            Err(_) => Err(self.shared.terminal_error()),
        };
        result
    }

    /// Resolves once the handshake has fully settled in this session's
    /// favour; fails with the terminal error otherwise.
    pub(crate) async fn wait_ready(&self) -> Result<(), WeftError> {
        let mut rx = self.ready_rx.clone();
        let result = match rx.wait_for(|ready| *ready).await {
            Ok(_) => Ok(()),
            Err(_) => Err(self.shared.terminal_error()),
        };
        result
    }

    /// Closes the connection: frees the dedup slot, cancels the conn
    /// token, and shuts down the underlying stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates the underlying stream's shutdown error.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Handle that can close this connection from any task.
    #[must_use]
    pub fn closer(&self) -> ConnCloser {
        ConnCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Local socket address, when the underlying stream has one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote socket address, when the underlying stream has one.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Error check + cancellation waker arming shared by all poll paths.
    fn poll_guard(&mut self, cx: &mut Context<'_>) -> Result<(), io::Error> {
        if let Some(err) = self.shared.error.get() {
            return Err(err.clone().into());
        }
        if self.shared.cancel.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Err(self.shared.terminal_error().into());
        }
        Ok(())
    }
}

impl AsyncRead for WeftConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if let Err(err) = this.poll_guard(cx) {
                return Poll::Ready(Err(err));
            }
            match &mut this.read_state {
                ReadState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                    Poll::Ready(Ok((inner, leftover))) => {
                        this.read_state = ReadState::Ready { inner, leftover };
                    }
                    Poll::Ready(Err(_)) => {
                        this.read_state = ReadState::Failed;
                        return Poll::Ready(Err(this.shared.terminal_error().into()));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                ReadState::Ready { inner, leftover } => {
                    if !leftover.is_empty() {
                        let n = leftover.len().min(buf.remaining());
                        buf.put_slice(&leftover[..n]);
                        leftover.drain(..n);
                        return Poll::Ready(Ok(()));
                    }
                    return Pin::new(inner).poll_read(cx, buf);
                }
                ReadState::Failed => {
                    return Poll::Ready(Err(this.shared.terminal_error().into()));
                }
            }
        }
    }
}

impl AsyncWrite for WeftConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Err(err) = this.poll_guard(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Err(err) = this.poll_guard(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.shared.release_dedup();
        this.shared.cancel.cancel();
        Pin::new(&mut this.write).poll_shutdown(cx)
    }
}

impl Drop for WeftConn {
    fn drop(&mut self) {
        self.shared.release_dedup();
        self.shared.cancel.cancel();
    }
}

/// Cheap handle that closes its connection from any task.
#[derive(Clone)]
pub struct ConnCloser {
    shared: Arc<Shared>,
}

impl ConnCloser {
    /// Tears the connection down; pending and future I/O on the conn
    /// fails promptly. Idempotent.
    pub fn close(&self) {
        self.shared.release_dedup();
        self.shared.cancel.cancel();
    }
}

struct HandshakeCtx {
    shared: Arc<Shared>,
    claimed_key: Option<PeerKey>,
    allow_list: Option<Arc<AllowList>>,
    secure_level: u8,
    dedup: Option<Arc<DeduplicationManager>>,
    nonce: SessionNonce,
    timeout: Duration,
    meta_tx: watch::Sender<Option<Meta>>,
    ready_tx: watch::Sender<bool>,
}

/// Background half of the overlay handshake. Owns the read half until
/// the preamble is read and every policy check has passed, then hands it
/// back through `handoff`. Every exit path either hands off or stamps a
/// terminal error; the meta/ready channels close with this task, so
/// waiters never hang.
async fn handshake(
    mut read_half: ReadHalf<BoxRawStream>,
    ctx: HandshakeCtx,
    handoff: oneshot::Sender<(ReadHalf<BoxRawStream>, Vec<u8>)>,
) {
    let shared = &ctx.shared;
    let mut buf = [0u8; PREAMBLE_LEN];
    let outcome = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            // closed under us before the preamble arrived
            return;
        }
        outcome = tokio::time::timeout(ctx.timeout, read_half.read_exact(&mut buf)) => outcome,
    };

    let preamble = match outcome {
        Err(_elapsed) => {
            debug!("handshake deadline elapsed before the preamble arrived");
            shared.fail(WeftError::ConnTimeout);
            return;
        }
        Ok(Err(err)) => {
            debug!(error = %err, "stream ended before the preamble completed");
            shared.fail(err.into());
            return;
        }
        Ok(Ok(_)) => match MetaPreamble::parse(&buf) {
            Ok(preamble) => preamble,
            Err(err) => {
                let version = match &err {
                    weft_wire::PreambleError::UnsupportedVersion { received, .. } => {
                        Some(*received)
                    }
                    weft_wire::PreambleError::UnknownProtocol => None,
                };
                let _ = ctx.meta_tx.send(Some(Meta {
                    version,
                    peer_key: None,
                }));
                warn!(error = %err, "rejecting peer");
                shared.fail(WeftError::Preamble(err));
                return;
            }
        },
    };

    let _ = ctx.meta_tx.send(Some(Meta {
        version: Some(preamble.version),
        peer_key: Some(preamble.peer_key),
    }));
    trace!(
        peer = %fmt_key(&preamble.peer_key),
        version = %preamble.version,
        "preamble received"
    );

    if let Some(expected) = ctx.claimed_key {
        if expected != preamble.peer_key {
            warn!(
                expected = %fmt_key(&expected),
                received = %fmt_key(&preamble.peer_key),
                "transport key mismatch"
            );
            shared.fail(WeftError::TransportSecurityCheck {
                expected,
                received: preamble.peer_key,
            });
            return;
        }
    }

    if let Some(allow) = &ctx.allow_list {
        if !allow.contains(&preamble.peer_key) {
            debug!(peer = %fmt_key(&preamble.peer_key), "peer not in allow list");
            shared.fail(WeftError::InvalidPeerKey {
                reason: "peer key is not in the allow list",
            });
            return;
        }
    }

    if let Some(dedup) = &ctx.dedup {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let slot = dedup.check(preamble.peer_key, ctx.secure_level, ctx.nonce, move || {
            if let Some(shared) = weak.upgrade() {
                shared.fail(WeftError::ClosedByDeduplicator);
            }
        });
        match slot {
            Some(handle) => {
                shared.store_dedup(handle);
                // the conn may have been closed while the slot was
                // claimed; give the slot straight back in that case
                if shared.error.get().is_some() || shared.cancel.is_cancelled() {
                    shared.release_dedup();
                    return;
                }
            }
            None => {
                debug!(peer = %fmt_key(&preamble.peer_key), "lost dedup tie-break");
                shared.fail(WeftError::ClosedByDeduplicator);
                return;
            }
        }
    }

    let _ = ctx.ready_tx.send(true);
    // leftover is empty today; the slot keeps room for a future inline
    // payload carried after the preamble
    let _ = handoff.send((read_half, Vec::new()));
}

/// Accept side of the overlay: announces our identity on each inbound
/// stream and wraps it with the listener's policy.
pub struct WeftListener {
    inner: Box<dyn TransportListener>,
    preamble: [u8; PREAMBLE_LEN],
    allow_list: Option<Arc<AllowList>>,
    secure_level: u8,
    dedup: Option<Arc<DeduplicationManager>>,
    cancel: CancellationToken,
}

impl fmt::Debug for WeftListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeftListener")
            .field("secure_level", &self.secure_level)
            .finish_non_exhaustive()
    }
}

impl WeftListener {
    pub(crate) fn new(
        inner: Box<dyn TransportListener>,
        own_key: PeerKey,
        allow_list: Option<Arc<AllowList>>,
        secure_level: u8,
        dedup: Option<Arc<DeduplicationManager>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            preamble: MetaPreamble::new(own_key).encode(),
            allow_list,
            secure_level,
            dedup,
            cancel,
        }
    }

    /// Waits for the next inbound connection and returns it wrapped.
    ///
    /// Does not wait for the peer's preamble: the handshake outcome is
    /// observed on the returned conn's first read.
    ///
    /// # Errors
    ///
    /// Propagates transport accept errors; fails with
    /// [`WeftError::Cancelled`] when the listener's token fires.
    pub async fn accept(&mut self) -> Result<WeftConn, WeftError> {
        let dialed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(WeftError::Cancelled),
            accepted = self.inner.accept() => accepted?,
        };
        let mut stream = dialed.stream;
        stream.write_all(&self.preamble).await?;
        Ok(WeftConn::wrap(
            stream,
            WrapOptions {
                claimed_peer_key: dialed.claimed_peer_key,
                allow_list: self.allow_list.clone(),
                secure_level: self.secure_level,
                dedup: self.dedup.clone(),
                cancel: self.cancel.clone(),
                handshake_timeout: HANDSHAKE_TIMEOUT,
            },
        ))
    }

    /// Bound address of the underlying listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }
}
