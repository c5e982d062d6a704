use std::{sync::Arc, time::Duration};

use http::HeaderMap;
use n0_error::e;
use rustls::{ClientConfig, RootCertStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    cache::{SessionCache, StalePolicy},
    endpoint::ProxyEndpoint,
    error::DialError,
    handshake::{TunnelRequest, connect_h2, connect_http1, merge_headers},
    parse::Authority,
    session::Session,
    stream::TunnelStream,
    transport::{self, Alpn, DynTlsDialer, TlsDialer},
};

/// Socket options for the TCP connection to the proxy.
#[derive(Debug, Clone)]
pub struct NetOpts {
    /// Maximum time to wait for the TCP connection. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Whether to set `TCP_NODELAY` on the connection.
    pub nodelay: bool,
}

impl Default for NetOpts {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}

/// Trust anchors for verifying `https` proxies.
#[derive(Debug, Clone)]
pub struct TlsOpts {
    roots: Arc<RootCertStore>,
}

impl Default for TlsOpts {
    /// Trusts the Mozilla root program, as shipped by `webpki-roots`.
    fn default() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            roots: Arc::new(roots),
        }
    }
}

impl TlsOpts {
    /// Trusts exactly the given roots.
    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }

    pub(crate) fn roots(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }
}

/// Configuration for a [`ConnectDialer`].
#[derive(derive_more::Debug, Clone)]
pub struct DialerOpts {
    /// Headers sent with every CONNECT request, in addition to the ones
    /// derived from the proxy URL.
    #[debug(skip)]
    pub(crate) headers: HeaderMap,
    pub(crate) net: NetOpts,
    pub(crate) tls: TlsOpts,
    #[debug("{:?}", tls_dialer.as_ref().map(|_| "DynTlsDialer"))]
    pub(crate) tls_dialer: Option<Arc<DynTlsDialer<'static>>>,
    pub(crate) reuse_sessions: bool,
    pub(crate) stale_policy: StalePolicy,
}

impl Default for DialerOpts {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            net: NetOpts::default(),
            tls: TlsOpts::default(),
            tls_dialer: None,
            reuse_sessions: true,
            stale_policy: StalePolicy::default(),
        }
    }
}

impl DialerOpts {
    /// Sets headers sent with every CONNECT request.
    ///
    /// They override same-named headers derived from the proxy URL.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn net(mut self, net: NetOpts) -> Self {
        self.net = net;
        self
    }

    pub fn tls(mut self, tls: TlsOpts) -> Self {
        self.tls = tls;
        self
    }

    /// Hands TCP connect and TLS handshake for `https` proxies to `dialer`.
    ///
    /// [`DialerOpts::tls`] and [`DialerOpts::net`] are not used for such proxies.
    pub fn tls_dialer(mut self, dialer: impl TlsDialer + 'static) -> Self {
        self.tls_dialer = Some(DynTlsDialer::new_arc(dialer));
        self
    }

    /// Enables or disables reuse of the HTTP/2 session to the proxy. Enabled by default.
    pub fn reuse_sessions(mut self, enabled: bool) -> Self {
        self.reuse_sessions = enabled;
        self
    }

    pub fn stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }
}

/// Per-call settings for [`ConnectDialer::dial_with`].
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    headers: Option<HeaderMap>,
    cancel: Option<CancellationToken>,
}

impl DialContext {
    /// Headers for this dial only. Each name replaces all default values of that name.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Aborts the dial once `token` is cancelled. Connections opened so far are closed.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Opens tunnels to targets through one forward proxy.
///
/// Cheap to clone; clones share the HTTP/2 session cache.
#[derive(Debug, Clone)]
pub struct ConnectDialer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: ProxyEndpoint,
    opts: DialerOpts,
    /// Default headers derived from the proxy URL, merged with `opts.headers`.
    headers: HeaderMap,
    tls: Arc<ClientConfig>,
    cache: SessionCache,
}

impl ConnectDialer {
    /// Creates a dialer for the proxy at `proxy_url` with default options.
    ///
    /// Performs no I/O.
    pub fn new(proxy_url: &str) -> Result<Self, DialError> {
        Self::with_opts(ProxyEndpoint::from_url(proxy_url)?, DialerOpts::default())
    }

    pub fn with_opts(endpoint: ProxyEndpoint, opts: DialerOpts) -> Result<Self, DialError> {
        let tls = transport::client_config(&opts)?;
        let headers = merge_headers(endpoint.default_headers(), &opts.headers);
        let cache = SessionCache::new(opts.stale_policy);
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                opts,
                headers,
                tls,
                cache,
            }),
        })
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.inner.endpoint
    }

    /// The HTTP/2 session currently cached, whether or not it is still usable.
    pub fn cached_session(&self) -> Option<Session> {
        self.inner.cache.peek()
    }

    /// Opens a tunnel to `address` (`host:port`).
    pub async fn dial(&self, address: &str) -> Result<TunnelStream, DialError> {
        self.dial_with(address, DialContext::default()).await
    }

    /// Opens a tunnel to `address` (`host:port`) with per-call headers and cancellation.
    #[instrument("dial", skip_all, fields(target = %address, proxy = %self.inner.endpoint))]
    pub async fn dial_with(
        &self,
        address: &str,
        ctx: DialContext,
    ) -> Result<TunnelStream, DialError> {
        let target = Authority::from_authority_str(address).map_err(|source| {
            e!(DialError::InvalidTarget {
                target: address.to_string(),
                source
            })
        })?;
        let req = TunnelRequest::new(target, &self.inner.headers, ctx.headers.as_ref());
        match ctx.cancel {
            Some(token) => match token.run_until_cancelled(self.inner.dial(&req)).await {
                Some(res) => res,
                None => {
                    debug!("dial cancelled");
                    Err(e!(DialError::Cancelled))
                }
            },
            None => self.inner.dial(&req).await,
        }
    }
}

impl Inner {
    async fn dial(&self, req: &TunnelRequest) -> Result<TunnelStream, DialError> {
        if self.opts.reuse_sessions
            && let Some(session) = self.cache.try_reuse()
        {
            match connect_h2(&session, req).await {
                Ok(stream) => {
                    debug!(session = session.id(), "reused cached session");
                    return Ok(TunnelStream::H2(stream));
                }
                Err(err) => {
                    debug!(
                        session = session.id(),
                        "cached session failed, dialing fresh: {err:#}"
                    );
                    self.cache.reuse_failed(&session);
                }
            }
        }

        let (io, alpn) = transport::open(&self.endpoint, &self.opts, &self.tls).await?;
        match alpn {
            Alpn::Unspecified | Alpn::Http1 => {
                let stream = connect_http1(io, req).await?;
                Ok(TunnelStream::Http1(stream))
            }
            Alpn::H2 => {
                let session = Session::handshake(io).await?;
                let stream = connect_h2(&session, req).await?;
                if self.opts.reuse_sessions {
                    self.cache.store(session);
                }
                Ok(TunnelStream::H2(stream))
            }
        }
    }
}
