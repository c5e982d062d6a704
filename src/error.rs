use http::StatusCode;
use n0_error::{AnyError, e, stack_error};

/// Errors that can occur while dialing a target through a CONNECT proxy.
///
/// Every variant is reported only after the connection that produced it has
/// been closed, so callers never own cleanup on the error path.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DialError {
    /// The proxy URL or dialer options are unusable. No I/O was attempted.
    #[error("invalid proxy configuration: {reason}")]
    Config {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The target passed to the dial call is not a `host:port` authority.
    #[error("invalid tunnel target {target:?}")]
    InvalidTarget {
        /// The target as passed by the caller.
        target: String,
        #[error(source)]
        source: AnyError,
    },

    /// Connecting to the proxy, the TLS handshake or the CONNECT exchange failed.
    #[error("transport to proxy failed")]
    Transport {
        #[error(source)]
        source: AnyError,
    },

    /// The proxy answered the CONNECT request with a status other than `200`.
    #[error("proxy responded with: {status_line}")]
    ProxyRejected {
        /// Status code of the proxy response.
        status: StatusCode,
        /// Status code and reason phrase as sent by the proxy, e.g. `403 Forbidden`.
        status_line: String,
    },

    /// The TLS handshake agreed on an application protocol we cannot speak.
    #[error("negotiated an unsupported application layer protocol: {alpn:?}")]
    Protocol {
        /// The negotiated ALPN identifier, lossily decoded.
        alpn: String,
    },

    /// The caller cancelled the dial before it completed.
    #[error("dial cancelled")]
    Cancelled,
}

impl DialError {
    #[track_caller]
    pub(crate) fn config(reason: impl ToString) -> Self {
        e!(DialError::Config {
            reason: reason.to_string()
        })
    }

    #[track_caller]
    pub(crate) fn transport(source: impl Into<AnyError>) -> Self {
        e!(DialError::Transport {
            source: source.into()
        })
    }

    /// Returns the proxy's response status if the proxy rejected the tunnel.
    pub fn rejected_status(&self) -> Option<StatusCode> {
        match self {
            DialError::ProxyRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
