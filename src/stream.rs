//! Byte streams handed out by the dialer.
//!
//! [`H2Stream`] turns one HTTP/2 CONNECT exchange (request body out, response
//! body in) into a full-duplex stream. [`Http1Stream`] is the proxy connection
//! itself after a successful HTTP/1.1 CONNECT. [`TunnelStream`] wraps either.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use h2::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

use crate::{
    session::{RawConn, StreamSlot},
    util::{BoxedIo, Prebuffered},
};

/// A tunnel carried by one HTTP/2 stream.
///
/// Reads drain the CONNECT response body, writes feed the request body.
/// Closing the tunnel never closes the session's transport, which other
/// tunnels and the session cache may still be using; use
/// [`H2Stream::close_conn`] for that.
#[derive(derive_more::Debug)]
pub struct H2Stream {
    raw: RawConn,
    /// Released once both directions are closed.
    slot: Option<StreamSlot>,
    #[debug(skip)]
    send: Option<SendStream<Bytes>>,
    #[debug(skip)]
    recv: Option<RecvStream>,
    #[debug(skip)]
    pending: Bytes,
}

impl H2Stream {
    pub(crate) fn new(slot: StreamSlot, send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            raw: slot.raw().clone(),
            slot: Some(slot),
            send: Some(send),
            recv: Some(recv),
            pending: Bytes::new(),
        }
    }

    /// The raw connection of the session this tunnel runs on.
    pub fn raw_conn(&self) -> &RawConn {
        &self.raw
    }

    /// Half-closes the outbound direction by ending the request body.
    ///
    /// Later writes fail with [`io::ErrorKind::BrokenPipe`].
    pub fn close_write(&mut self) -> io::Result<()> {
        let res = match self.send.take() {
            Some(mut send) => send.send_data(Bytes::new(), true).map_err(h2_to_io),
            None => Ok(()),
        };
        self.release_if_closed();
        res
    }

    /// Half-closes the inbound direction. Later reads return end of stream.
    pub fn close_read(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.recv.take();
        self.release_if_closed();
        Ok(())
    }

    fn release_if_closed(&mut self) {
        if self.send.is_none() && self.recv.is_none() {
            self.slot.take();
        }
    }

    /// Closes both directions, leaving the session's transport open.
    ///
    /// Both directions are closed even if the first fails; the outbound
    /// error is reported if both do.
    pub fn close(&mut self) -> io::Result<()> {
        let write = self.close_write();
        let read = self.close_read();
        write.and(read)
    }

    /// Closes the session's transport, tearing down every tunnel on it.
    pub fn close_conn(&mut self) -> io::Result<()> {
        self.raw.close();
        Ok(())
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            let Some(recv) = this.recv.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            match ready!(recv.poll_data(cx)) {
                // Empty DATA frames carry no bytes; returning them would read as EOF.
                Some(Ok(data)) if data.is_empty() => continue,
                Some(Ok(data)) => {
                    recv.flow_control()
                        .release_capacity(data.len())
                        .map_err(h2_to_io)?;
                    this.pending = data;
                }
                Some(Err(err)) => {
                    if err.reason() == Some(h2::Reason::NO_ERROR) {
                        trace!("tunnel stream reset with NO_ERROR, treating as end of stream");
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(h2_to_io(err)));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let Some(send) = self.send.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel write half is closed",
            )));
        };
        send.reserve_capacity(buf.len());
        loop {
            return match ready!(send.poll_capacity(cx)) {
                Some(Ok(0)) => continue,
                Some(Ok(n)) => {
                    let n = n.min(buf.len());
                    send.send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_to_io)?;
                    Poll::Ready(Ok(n))
                }
                Some(Err(err)) => Poll::Ready(Err(h2_to_io(err))),
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "tunnel stream closed by the proxy",
                ))),
            };
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session's connection driver.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close_write())
    }
}

fn h2_to_io(err: h2::Error) -> io::Error {
    if err.is_io() {
        if let Some(err) = err.into_io() {
            return err;
        }
        return io::Error::other("h2 transport error");
    }
    io::Error::other(err)
}

/// The proxy connection after a successful HTTP/1.1 CONNECT.
///
/// Bytes the proxy sent right after its response header section are kept
/// and returned by the first reads.
#[derive(derive_more::Debug)]
pub struct Http1Stream {
    /// `None` once [`Http1Stream::close`] released the connection.
    #[debug(skip)]
    io: Option<Prebuffered<BoxedIo>>,
    read_closed: bool,
}

impl Http1Stream {
    pub(crate) fn new(io: Prebuffered<BoxedIo>) -> Self {
        Self {
            io: Some(io),
            read_closed: false,
        }
    }

    /// Half-closes the outbound direction.
    pub async fn close_write(&mut self) -> io::Result<()> {
        match self.io.as_mut() {
            Some(io) => io.shutdown().await,
            None => Ok(()),
        }
    }

    /// Stops reading; later reads return end of stream.
    pub fn close_read(&mut self) {
        self.read_closed = true;
    }

    /// Shuts down and drops the connection to the proxy.
    ///
    /// Later reads return end of stream and later writes fail with
    /// [`io::ErrorKind::BrokenPipe`].
    pub async fn close(&mut self) -> io::Result<()> {
        self.close_read();
        match self.io.take() {
            Some(mut io) => io.shutdown().await,
            None => Ok(()),
        }
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel is closed")
}

impl AsyncRead for Http1Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_closed {
            return Poll::Ready(Ok(()));
        }
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for Http1Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// An established tunnel to the target, over either proxy protocol.
#[derive(Debug)]
pub enum TunnelStream {
    /// The proxy connection itself, after an HTTP/1.1 CONNECT.
    Http1(Http1Stream),
    /// One stream of a shared HTTP/2 session.
    H2(H2Stream),
}

impl TunnelStream {
    /// Returns `true` if the tunnel runs on a shared HTTP/2 session.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, TunnelStream::H2(_))
    }

    /// Id of the HTTP/2 session carrying this tunnel, if any.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            TunnelStream::Http1(_) => None,
            TunnelStream::H2(stream) => Some(stream.raw_conn().id()),
        }
    }

    /// Closes both directions of the tunnel.
    ///
    /// For an HTTP/2 tunnel the shared session stays open.
    pub async fn close(&mut self) -> io::Result<()> {
        match self {
            TunnelStream::Http1(stream) => stream.close().await,
            TunnelStream::H2(stream) => stream.close(),
        }
    }

    /// Closes the underlying transport connection to the proxy.
    ///
    /// For an HTTP/1.1 tunnel this is the same as [`TunnelStream::close`].
    /// For an HTTP/2 tunnel this tears down every tunnel on the session.
    pub async fn close_conn(&mut self) -> io::Result<()> {
        match self {
            TunnelStream::Http1(stream) => stream.close().await,
            TunnelStream::H2(stream) => stream.close_conn(),
        }
    }

    /// Half-closes the outbound direction.
    pub async fn close_write(&mut self) -> io::Result<()> {
        match self {
            TunnelStream::Http1(stream) => stream.close_write().await,
            TunnelStream::H2(stream) => stream.close_write(),
        }
    }

    /// Half-closes the inbound direction.
    pub fn close_read(&mut self) -> io::Result<()> {
        match self {
            TunnelStream::Http1(stream) => {
                stream.close_read();
                Ok(())
            }
            TunnelStream::H2(stream) => stream.close_read(),
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Http1(stream) => Pin::new(stream).poll_read(cx, buf),
            TunnelStream::H2(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Http1(stream) => Pin::new(stream).poll_write(cx, buf),
            TunnelStream::H2(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Http1(stream) => Pin::new(stream).poll_flush(cx),
            TunnelStream::H2(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Http1(stream) => Pin::new(stream).poll_shutdown(cx),
            TunnelStream::H2(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{Method, Request, Response, StatusCode};
    use n0_error::{Result, StdResultExt, anyerr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::time::FutureExt;

    use super::*;
    use crate::{
        session::Session,
        tests::{MockH2Server, h2_session_pair},
    };

    struct OpenTunnel {
        stream: H2Stream,
        session: Session,
        /// Server side: body of the response, i.e. bytes towards the client.
        to_client: SendStream<Bytes>,
        /// Server side: body of the CONNECT request, i.e. bytes from the client.
        from_client: RecvStream,
        /// Keeps the mock proxy task alive for the duration of the test.
        server: MockH2Server,
    }

    async fn open_tunnel() -> Result<OpenTunnel> {
        let (session, mut server) = h2_session_pair().await?;
        let request = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(())
            .anyerr()?;
        let (response, send) = session
            .send_request()
            .ready()
            .await
            .map_err(|err| anyerr!(err))?
            .send_request(request, false)
            .map_err(|err| anyerr!(err))?;
        let (request, mut respond) = server.next_request().await?;
        assert_eq!(request.method(), Method::CONNECT);
        let to_client = respond
            .send_response(Response::new(()), false)
            .map_err(|err| anyerr!(err))?;
        let response = response.await.map_err(|err| anyerr!(err))?;
        assert_eq!(response.status(), StatusCode::OK);
        let stream = H2Stream::new(StreamSlot::new(session.raw()), send, response.into_body());
        Ok(OpenTunnel {
            stream,
            session,
            to_client,
            from_client: request.into_body(),
            server,
        })
    }

    #[tokio::test]
    async fn writes_reach_request_body() -> Result {
        let OpenTunnel {
            mut stream,
            mut from_client,
            session: _session,
            server: _server,
            ..
        } = open_tunnel().await?;
        stream.write_all(b"ping").await?;
        stream.close_write()?;

        let mut received = Vec::new();
        while let Some(chunk) = from_client.data().await {
            let chunk = chunk.map_err(|err| anyerr!(err))?;
            from_client
                .flow_control()
                .release_capacity(chunk.len())
                .map_err(|err| anyerr!(err))?;
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"ping");

        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        Ok(())
    }

    #[tokio::test]
    async fn reads_drain_response_body() -> Result {
        let OpenTunnel {
            mut stream,
            mut to_client,
            session: _session,
            server: _server,
            ..
        } = open_tunnel().await?;
        to_client
            .send_data(Bytes::new(), false)
            .map_err(|err| anyerr!(err))?;
        to_client
            .send_data(Bytes::from_static(b"pong"), true)
            .map_err(|err| anyerr!(err))?;

        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .timeout(Duration::from_secs(3))
            .await
            .anyerr()??;
        assert_eq!(buf, b"pong");
        Ok(())
    }

    #[tokio::test]
    async fn small_reads_keep_the_rest_of_a_frame() -> Result {
        let OpenTunnel {
            mut stream,
            mut to_client,
            session: _session,
            server: _server,
            ..
        } = open_tunnel().await?;
        to_client
            .send_data(Bytes::from_static(b"abcdef"), false)
            .map_err(|err| anyerr!(err))?;

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"abcd");
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ef");
        Ok(())
    }

    #[tokio::test]
    async fn close_read_yields_eof() -> Result {
        let OpenTunnel { mut stream, .. } = open_tunnel().await?;
        stream.close_read()?;
        let mut buf = [0u8; 8];
        let n = stream
            .read(&mut buf)
            .timeout(Duration::from_secs(3))
            .await
            .std_context("read after close_read hung")??;
        assert_eq!(n, 0);
        Ok(())
    }

    #[tokio::test]
    async fn close_keeps_session_open() -> Result {
        let OpenTunnel {
            mut stream,
            session,
            ..
        } = open_tunnel().await?;
        stream.close()?;
        assert!(!session.raw().is_closed());
        assert!(session.can_take_new_request());
        Ok(())
    }

    #[tokio::test]
    async fn close_releases_stream_slot() -> Result {
        let OpenTunnel {
            mut stream,
            session,
            ..
        } = open_tunnel().await?;
        assert_eq!(session.raw().open_streams(), 1);
        stream.close_write()?;
        assert_eq!(session.raw().open_streams(), 1);
        stream.close_read()?;
        assert_eq!(session.raw().open_streams(), 0);

        let OpenTunnel {
            stream, session, ..
        } = open_tunnel().await?;
        drop(stream);
        assert_eq!(session.raw().open_streams(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn http1_close_drops_connection() -> Result {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = Http1Stream::new(Prebuffered::new(Box::new(client) as BoxedIo, 1024));
        stream.close().await?;

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await?;
        assert!(buf.is_empty());
        // The peer sees the connection gone, not just a half-close.
        let err = server.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(stream.read(&mut [0u8; 4]).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn close_conn_tears_down_session() -> Result {
        let OpenTunnel {
            mut stream,
            session,
            ..
        } = open_tunnel().await?;
        stream.close_conn()?;
        assert!(session.raw().is_closed());
        assert!(!session.can_take_new_request());
        Ok(())
    }
}
