//! A read-ahead buffer for Tokio streams.
//!
//! [`Prebuffered`] lets the handshake code pull bytes off a connection until a
//! full response header section is available, parse it, and then hand the same
//! connection to the caller without losing bytes the peer sent right after the
//! header section. Writes pass straight through to the inner stream.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 1024;

/// A prebuffering wrapper around a stream.
pub struct Prebuffered<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S: AsyncRead + Unpin> Prebuffered<S> {
    /// Creates a new `Prebuffered` wrapper that buffers at most `max_len` bytes.
    pub(crate) fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Buffers more data from the inner stream.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the stream ended, so callers
    /// looping until a complete message is buffered always terminate.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        if n == 0 && max > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a complete message was received",
            ));
        }
        Ok(n)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn cursor(data: &'static [u8]) -> Cursor<&'static [u8]> {
        Cursor::new(data)
    }

    #[tokio::test]
    async fn buffer_more_stops_at_max() {
        let mut p = Prebuffered::new(cursor(b"abcdefgh"), 4);
        assert_eq!(p.buffer_more().await.unwrap(), 4);
        assert_eq!(p.buffer(), b"abcd");
        assert!(p.is_full());
    }

    #[tokio::test]
    async fn buffer_more_reports_eof() {
        let mut p = Prebuffered::new(cursor(b""), 16);
        let err = p.buffer_more().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_drains_buffer_before_inner() {
        let mut p = Prebuffered::new(cursor(b"HTTP/1.1 200 OK\r\n\r\npayload"), 19);
        p.buffer_more().await.unwrap();
        p.discard(19);
        let mut rest = Vec::new();
        p.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"payload");
    }

    #[tokio::test]
    async fn leftover_after_discard_is_read_first() {
        let mut p = Prebuffered::new(cursor(b"headtail-and-more"), 8);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"headtail");
        p.discard(4);

        let mut buf = [0u8; 4];
        p.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tail");

        let mut rest = Vec::new();
        p.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"-and-more");
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut p = Prebuffered::new(client, 16);
        p.write_all(b"CONNECT").await.unwrap();
        p.flush().await.unwrap();

        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"CONNECT");
    }
}
