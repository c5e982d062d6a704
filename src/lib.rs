//! Dial targets through an HTTP forward proxy with `CONNECT`.
//!
//! A [`ConnectDialer`] talks HTTP/1.1 to plaintext proxies and picks HTTP/1.1
//! or HTTP/2 via ALPN for TLS proxies. HTTP/2 sessions are cached and shared
//! by later dials, so many tunnels can ride one proxy connection.

mod cache;
mod dialer;
mod endpoint;
mod error;
mod handshake;
mod parse;
mod session;
mod stream;
mod transport;
mod util;


pub use {
    cache::StalePolicy,
    dialer::{ConnectDialer, DialContext, DialerOpts, NetOpts, TlsOpts},
    endpoint::{ProxyEndpoint, Scheme},
    error::DialError,
    parse::{Authority, HttpResponse},
    session::{RawConn, Session},
    stream::{H2Stream, Http1Stream, TunnelStream},
    transport::{ALPN_H2, ALPN_HTTP1, Alpn, TlsDialer},
    util::{AsyncIo, BoxedIo},
};
