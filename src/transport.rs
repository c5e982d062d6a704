use std::{io, sync::Arc};

use dynosaur::dynosaur;
use n0_error::anyerr;
use rustls::{ClientConfig, pki_types::ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::time::FutureExt;
use tracing::{debug, instrument};

use crate::{
    dialer::{DialerOpts, NetOpts},
    endpoint::{ProxyEndpoint, Scheme},
    error::DialError,
    util::BoxedIo,
};

/// ALPN identifier for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Application protocol agreed with the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    /// Nothing was negotiated (plaintext, or TLS without ALPN); HTTP/1.1 is assumed.
    Unspecified,
    /// HTTP/1.1 was negotiated explicitly.
    Http1,
    /// HTTP/2 was negotiated.
    H2,
}

impl Alpn {
    /// Maps a negotiated ALPN identifier.
    ///
    /// Fails with [`DialError::Protocol`] for anything but `h2` and `http/1.1`.
    pub fn from_wire(proto: Option<&[u8]>) -> Result<Self, DialError> {
        match proto {
            None | Some(b"") => Ok(Alpn::Unspecified),
            Some(ALPN_HTTP1) => Ok(Alpn::Http1),
            Some(ALPN_H2) => Ok(Alpn::H2),
            Some(other) => Err(n0_error::e!(DialError::Protocol {
                alpn: String::from_utf8_lossy(other).into_owned()
            })),
        }
    }

    pub fn is_multiplexed(self) -> bool {
        self == Alpn::H2
    }
}

#[dynosaur(pub(crate) DynTlsDialer = dyn(box) TlsDialer)]
/// Custom TLS dialing for `https` proxies.
///
/// When configured, the dialer hands TCP connect and TLS handshake to this
/// implementation and trusts the ALPN identifier it reports. It should offer
/// `h2` and `http/1.1`; anything else it reports fails the dial.
pub trait TlsDialer: Send + Sync {
    /// Connects to `endpoint` and completes the TLS handshake.
    ///
    /// Returns the established stream and the negotiated ALPN identifier, if any.
    fn dial_tls<'a>(
        &'a self,
        endpoint: &'a ProxyEndpoint,
    ) -> impl Future<Output = io::Result<(BoxedIo, Option<Vec<u8>>)>> + Send + 'a;
}

/// Opens a transport connection to the proxy and reports the agreed protocol.
///
/// Every error is returned after the partially opened connection was dropped.
#[instrument(level = "debug", skip_all, fields(proxy = %endpoint))]
pub(crate) async fn open(
    endpoint: &ProxyEndpoint,
    opts: &DialerOpts,
    tls: &Arc<ClientConfig>,
) -> Result<(BoxedIo, Alpn), DialError> {
    match endpoint.scheme() {
        Scheme::Http => {
            let tcp = connect_tcp(endpoint, &opts.net).await?;
            Ok((Box::new(tcp), Alpn::Unspecified))
        }
        Scheme::Https => {
            if let Some(tls_dialer) = opts.tls_dialer.as_ref() {
                let (io, alpn) = tls_dialer
                    .dial_tls(endpoint)
                    .await
                    .map_err(DialError::transport)?;
                // On error `io` is dropped here, closing it.
                let alpn = Alpn::from_wire(alpn.as_deref())?;
                debug!(?alpn, "custom tls dialer connected");
                return Ok((io, alpn));
            }
            let tcp = connect_tcp(endpoint, &opts.net).await?;
            let server_name = ServerName::try_from(endpoint.host().to_string())
                .map_err(|err| DialError::transport(anyerr!(err)))?;
            let tls_stream = TlsConnector::from(tls.clone())
                .connect(server_name, tcp)
                .await
                .map_err(DialError::transport)?;
            let alpn = Alpn::from_wire(tls_stream.get_ref().1.alpn_protocol())?;
            debug!(?alpn, "tls handshake complete");
            Ok((Box::new(tls_stream), alpn))
        }
    }
}

async fn connect_tcp(endpoint: &ProxyEndpoint, net: &NetOpts) -> Result<TcpStream, DialError> {
    let addr = endpoint.addr();
    let connect = TcpStream::connect(addr.as_str());
    let stream = match net.connect_timeout {
        Some(timeout) => connect.timeout(timeout).await.map_err(|_| {
            DialError::transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {addr} timed out"),
            ))
        })?,
        None => connect.await,
    }
    .map_err(DialError::transport)?;
    if net.nodelay {
        stream.set_nodelay(true).map_err(DialError::transport)?;
    }
    debug!(%addr, "connected to proxy");
    Ok(stream)
}

/// Builds the rustls client config used when no [`TlsDialer`] is set.
pub(crate) fn client_config(opts: &DialerOpts) -> Result<Arc<ClientConfig>, DialError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(DialError::config)?
        .with_root_certificates(opts.tls.roots())
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()];
    Ok(Arc::new(config))
}
