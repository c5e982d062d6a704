use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use bytes::Bytes;
use h2::client::SendRequest;
use n0_error::anyerr;
use n0_future::task::AbortOnDropHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span};

use crate::{error::DialError, util::BoxedIo};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Handle to the transport connection under an HTTP/2 session.
///
/// The connection is driven by a background task. Clones share that task:
/// the cache and every tunnel opened on the session hold one, and the
/// transport stays open until [`RawConn::close`] is called, the peer goes
/// away, or the last clone is dropped.
#[derive(Debug, Clone)]
pub struct RawConn(Arc<RawConnInner>);

#[derive(Debug)]
struct RawConnInner {
    id: u64,
    closed: CancellationToken,
    /// Set once the peer refused a new stream, e.g. after GOAWAY.
    refusing: AtomicBool,
    /// Tunnels open or being opened on this connection.
    open_streams: AtomicUsize,
    _driver: AbortOnDropHandle<()>,
}

impl RawConn {
    fn spawn(connection: h2::client::Connection<BoxedIo, Bytes>) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let closed = CancellationToken::new();
        let driver = tokio::spawn(
            {
                let closed = closed.clone();
                async move {
                    tokio::select! {
                        res = connection => match res {
                            Ok(()) => debug!("session finished"),
                            Err(err) => debug!("session failed: {err:#}"),
                        },
                        _ = closed.cancelled() => debug!("session closed locally"),
                    }
                    // Dropping the connection future closes the transport.
                    closed.cancel();
                }
            }
            .instrument(error_span!("h2-session", id)),
        );
        Self(Arc::new(RawConnInner {
            id,
            closed,
            refusing: AtomicBool::new(false),
            open_streams: AtomicUsize::new(0),
            _driver: AbortOnDropHandle::new(driver),
        }))
    }

    /// Process-unique id of the session, for logging and diagnostics.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Closes the transport, failing every tunnel still open on it.
    pub fn close(&self) {
        self.0.closed.cancel();
    }

    /// Returns `true` once the transport is closed, locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.0.closed.is_cancelled()
    }

    /// Stops handing out this connection for new tunnels, leaving open ones running.
    pub(crate) fn refuse_new_streams(&self) {
        self.0.refusing.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once the peer refused a new stream on this connection.
    pub fn is_refusing(&self) -> bool {
        self.0.refusing.load(Ordering::Relaxed)
    }

    /// Number of tunnels open or being opened on this connection.
    pub fn open_streams(&self) -> usize {
        self.0.open_streams.load(Ordering::Relaxed)
    }

    pub(crate) fn same_connection(&self, other: &RawConn) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An HTTP/2 client session to the proxy: the request handle and the raw
/// connection it runs on, always kept together.
#[derive(derive_more::Debug, Clone)]
pub struct Session {
    #[debug(skip)]
    send_request: SendRequest<Bytes>,
    raw: RawConn,
}

impl Session {
    /// Performs the HTTP/2 connection preface over `io` and spawns the connection driver.
    ///
    /// On failure `io` has been dropped, which closes it.
    pub(crate) async fn handshake(io: BoxedIo) -> Result<Self, DialError> {
        let (send_request, connection) = h2::client::handshake(io)
            .await
            .map_err(|err| DialError::transport(anyerr!(err)))?;
        let raw = RawConn::spawn(connection);
        debug!(session = raw.id(), "started h2 session");
        Ok(Self { send_request, raw })
    }

    /// Whether the session may still carry new tunnels.
    ///
    /// False once the transport is closed, once the peer refused a stream
    /// (it sent GOAWAY), or while the tunnels on it already use up the
    /// peer's `SETTINGS_MAX_CONCURRENT_STREAMS`. This is a local check; a
    /// GOAWAY that arrived since the last request is only noticed by the
    /// next one.
    pub fn can_take_new_request(&self) -> bool {
        !self.raw.is_closed()
            && !self.raw.is_refusing()
            && self.raw.open_streams() < self.send_request.current_max_send_streams()
    }

    pub fn raw(&self) -> &RawConn {
        &self.raw
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    pub(crate) fn send_request(&self) -> SendRequest<Bytes> {
        self.send_request.clone()
    }
}

/// Counts one tunnel against its session's concurrent stream limit while alive.
#[derive(Debug)]
pub(crate) struct StreamSlot(RawConn);

impl StreamSlot {
    pub(crate) fn new(raw: &RawConn) -> Self {
        raw.0.open_streams.fetch_add(1, Ordering::Relaxed);
        Self(raw.clone())
    }

    pub(crate) fn raw(&self) -> &RawConn {
        &self.0
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.0.open_streams.fetch_sub(1, Ordering::Relaxed);
    }
}
