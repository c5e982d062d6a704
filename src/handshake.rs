//! The CONNECT exchange, once the transport to the proxy is up.

use h2::Reason;
use http::{HeaderMap, Method, Request, StatusCode, Version};
use n0_error::{StdResultExt, anyerr};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::{
    error::DialError,
    parse::{Authority, HttpResponse, status_text},
    session::{Session, StreamSlot},
    stream::{H2Stream, Http1Stream},
    util::{BoxedIo, Prebuffered},
};

/// Upper bound for the proxy's HTTP/1.1 response header section.
const MAX_RESPONSE_HEADER_LEN: usize = 8192;

/// A CONNECT request for one target with its final header set.
#[derive(Debug, Clone)]
pub(crate) struct TunnelRequest {
    pub(crate) target: Authority,
    pub(crate) headers: HeaderMap,
}

impl TunnelRequest {
    /// Merges the dialer's default headers with per-call `extra` headers.
    ///
    /// A header name present in `extra` replaces every default value of that name.
    pub(crate) fn new(
        target: Authority,
        defaults: &HeaderMap,
        extra: Option<&HeaderMap>,
    ) -> Self {
        let mut headers = match extra {
            Some(extra) => merge_headers(defaults, extra),
            None => defaults.clone(),
        };
        // The target is always sent as `Host` (or `:authority`), never from headers.
        headers.remove(http::header::HOST);
        Self { target, headers }
    }

    /// Builds the HTTP/2 CONNECT request: `:method CONNECT` and `:authority` only.
    pub(crate) fn to_h2(&self) -> Result<Request<()>, DialError> {
        let uri = self.target.to_uri().map_err(DialError::transport)?;
        let mut request = Request::builder()
            .method(Method::CONNECT)
            .uri(uri)
            .version(Version::HTTP_2)
            .body(())
            .std_context("invalid CONNECT request")
            .map_err(DialError::transport)?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// Returns `defaults` with every name in `overrides` replaced by its values there.
pub(crate) fn merge_headers(defaults: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut headers = defaults.clone();
    for name in overrides.keys() {
        headers.remove(name);
    }
    for (name, value) in overrides.iter() {
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Performs an HTTP/1.1 CONNECT on a fresh proxy connection.
///
/// On success the connection becomes the tunnel. On failure it is shut down
/// and dropped before the error is returned.
#[instrument(level = "debug", skip_all, fields(target = %req.target))]
pub(crate) async fn connect_http1(
    io: BoxedIo,
    req: &TunnelRequest,
) -> Result<Http1Stream, DialError> {
    let mut io = Prebuffered::new(io, MAX_RESPONSE_HEADER_LEN);
    match exchange_http1(&mut io, req).await {
        Ok(()) => {
            debug!("tunnel established");
            Ok(Http1Stream::new(io))
        }
        Err(err) => {
            debug!("CONNECT failed: {err:#}");
            io.shutdown().await.ok();
            Err(err)
        }
    }
}

async fn exchange_http1(
    io: &mut Prebuffered<BoxedIo>,
    req: &TunnelRequest,
) -> Result<(), DialError> {
    io.write_all(&req.target.to_connect_request(&req.headers))
        .await
        .map_err(DialError::transport)?;
    io.flush().await.map_err(DialError::transport)?;
    let response = HttpResponse::read(io).await.map_err(DialError::transport)?;
    debug!(status = %response.status, "response from proxy");
    if response.status != StatusCode::OK {
        return Err(n0_error::e!(DialError::ProxyRejected {
            status: response.status,
            status_line: response.status_text(),
        }));
    }
    Ok(())
}

/// Opens a CONNECT stream on an HTTP/2 session.
///
/// If the peer refuses the stream before processing it (GOAWAY, or a
/// `REFUSED_STREAM` reset) the session is marked as taking no new tunnels
/// and stays open for the ones it carries. Any other failure closes the
/// session's raw connection, so a session that failed once is never handed
/// out again.
#[instrument(level = "debug", skip_all, fields(target = %req.target, session = session.id()))]
pub(crate) async fn connect_h2(
    session: &Session,
    req: &TunnelRequest,
) -> Result<H2Stream, DialError> {
    let request = req.to_h2()?;
    match exchange_h2(session, request).await {
        Ok(stream) => {
            debug!("tunnel established");
            Ok(stream)
        }
        Err(H2Failure::Refused(err)) => {
            debug!("session refuses new streams: {err:#}");
            session.raw().refuse_new_streams();
            Err(DialError::transport(anyerr!(err)))
        }
        Err(H2Failure::Failed(err)) => {
            debug!("CONNECT failed, closing session: {err:#}");
            session.raw().close();
            Err(err)
        }
    }
}

enum H2Failure {
    /// The proxy never processed the request.
    Refused(h2::Error),
    Failed(DialError),
}

async fn exchange_h2(session: &Session, request: Request<()>) -> Result<H2Stream, H2Failure> {
    let slot = StreamSlot::new(session.raw());
    let mut send_request = session
        .send_request()
        .ready()
        .await
        .map_err(H2Failure::Refused)?;
    let (response, send) = send_request
        .send_request(request, false)
        .map_err(H2Failure::Refused)?;
    let response = response.await.map_err(|err| {
        if is_refused(&err) {
            H2Failure::Refused(err)
        } else {
            H2Failure::Failed(DialError::transport(anyerr!(err)))
        }
    })?;
    debug!(status = %response.status(), "response from proxy");
    if response.status() != StatusCode::OK {
        return Err(H2Failure::Failed(n0_error::e!(DialError::ProxyRejected {
            status: response.status(),
            status_line: status_text(response.status(), None),
        })));
    }
    Ok(H2Stream::new(slot, send, response.into_body()))
}

/// Whether the peer guarantees it did not act on the stream (RFC 9113, 8.7).
fn is_refused(err: &h2::Error) -> bool {
    match err.reason() {
        Some(Reason::REFUSED_STREAM) => err.is_remote(),
        Some(Reason::NO_ERROR) => err.is_go_away(),
        _ => false,
    }
}
