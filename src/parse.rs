use std::str::FromStr;

use http::{HeaderMap, HeaderValue, StatusCode, uri::Uri};
use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};
use tokio::io::{self, AsyncRead};

use crate::util::Prebuffered;

/// Host and port of a tunnel target, in CONNECT authority-form.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme. IPv6 literals keep their brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Parses an authority-form URI with no scheme and no path.
    ///
    /// Note: the URI must include a port.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        ensure_any!(uri.path_and_query().is_none(), "Expected URI without path");
        let authority = uri.authority().context("Expected URI with authority")?;
        ensure_any!(
            !authority.as_str().contains('@'),
            "Expected URI without userinfo"
        );
        let host = authority.host();
        ensure_any!(!host.is_empty(), "Expected URI with host");
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parses an authority-form request target from a string.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        Self::from_authority_uri(&Uri::from_str(s).std_context("Invalid authority string")?)
    }

    /// Returns the authority as an authority-form [`Uri`], the `:authority` of an HTTP/2 CONNECT.
    pub(crate) fn to_uri(&self) -> Result<Uri> {
        Uri::from_str(&self.to_string()).std_context("Invalid authority")
    }

    /// Serializes an HTTP/1.1 CONNECT request for this authority.
    ///
    /// The `Host` header always carries the target; `headers` must not contain one.
    pub(crate) fn to_connect_request(&self, headers: &HeaderMap) -> Vec<u8> {
        let mut out = format!("CONNECT {self} HTTP/1.1\r\nHost: {self}\r\n").into_bytes();
        for (name, value) in headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Parsed HTTP/1.x response with status, reason, and headers.
#[derive(derive_more::Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpResponse {
    /// Returns the status code and reason phrase as the proxy sent them.
    ///
    /// Falls back to the canonical reason when the proxy sent none.
    pub fn status_text(&self) -> String {
        status_text(self.status, self.reason.as_deref())
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .std_context("Failed to parse HTTP response")?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res
                    .reason
                    .filter(|reason| !reason.is_empty())
                    .map(ToOwned::to_owned);
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    HttpResponse {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the response status line and header section.
    ///
    /// Does not remove the header section from `reader`.
    /// Returns [`io::ErrorKind::OutOfMemory`] if the header section exceeds the buffer limit.
    pub(crate) async fn peek(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<(usize, Self)> {
        if let Some(response) = Self::parse_with_len(reader.buffer())? {
            return Ok(response);
        }
        while !reader.is_full() {
            reader.buffer_more().await?;
            if let Some(response) = Self::parse_with_len(reader.buffer())? {
                return Ok(response);
            }
        }

        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "Buffer size limit reached before end of response header section",
        )
        .into())
    }

    /// Reads and parses the response status line and header section.
    ///
    /// Removes the header section from `reader`; any bytes after it stay buffered.
    pub(crate) async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Self> {
        let (len, response) = Self::peek(reader).await?;
        reader.discard(len);
        Ok(response)
    }
}

/// Formats `"{code} {reason}"`, using the canonical reason when none is given.
pub(crate) fn status_text(status: StatusCode, reason: Option<&str>) -> String {
    let reason = reason.or(status.canonical_reason()).unwrap_or("");
    format!("{} {}", status.as_u16(), reason).trim_end().to_string()
}
