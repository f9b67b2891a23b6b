//! A peekable buffer over a Tokio `AsyncRead`.
//!
//! [`PeekBuffer`] accumulates input so that a header section can be parsed
//! (and partially consumed) without losing the bytes that follow it. Reads
//! drain the buffer first and then fall through to the inner reader.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

pub(crate) struct PeekBuffer<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> PeekBuffer<R> {
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            limit,
        }
    }

    /// Unconsumed bytes accumulated so far.
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf[..]
    }

    /// True once the buffer holds `limit` bytes.
    pub(crate) fn at_limit(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Drops `n` bytes from the front of the buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Reads more data from the inner reader into the buffer.
    ///
    /// Returns the number of bytes added, 0 at EOF or when the limit is
    /// reached.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner).take(room as u64).read_buf(&mut self.buf).await
    }

    /// Fills until at least `n` bytes are buffered.
    ///
    /// Returns the buffered bytes, which may be shorter than `n` when EOF or
    /// the buffer limit is hit first.
    pub(crate) async fn peek_at_least(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                break;
            }
        }
        Ok(&self.buf[..])
    }

    /// Fills until the buffer contains a LF-terminated line starting at the
    /// front, then consumes and returns it (including the terminator).
    pub(crate) async fn take_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                return Ok(self.buf.split_to(pos + 1).freeze());
            }
            if self.at_limit() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line exceeds buffer limit",
                ));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof before end of line",
                ));
            }
        }
    }

    /// Returns the buffered remainder and the inner reader.
    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekBuffer<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn buffer(data: &'static [u8], limit: usize) -> PeekBuffer<Cursor<&'static [u8]>> {
        PeekBuffer::new(Cursor::new(data), limit)
    }

    #[tokio::test]
    async fn fill_respects_limit() {
        let mut p = buffer(b"abcdefgh", 4);
        p.fill().await.unwrap();
        assert_eq!(p.buffered(), b"abcd");
        assert!(p.at_limit());
        assert_eq!(p.fill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fill_eof() {
        let mut p = buffer(b"", 16);
        assert_eq!(p.fill().await.unwrap(), 0);
        assert_eq!(p.buffered(), b"");
    }

    #[tokio::test]
    async fn consume_then_read_falls_through() {
        let mut p = buffer(b"abcdef", 4);
        p.fill().await.unwrap();
        p.consume(2);
        assert_eq!(p.buffered(), b"cd");

        let mut rest = Vec::new();
        p.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"cdef");
    }

    #[tokio::test]
    async fn peek_at_least_stops_at_eof() {
        let mut p = buffer(b"abc", 16);
        let seen = p.peek_at_least(10).await.unwrap();
        assert_eq!(seen, b"abc");
    }

    #[tokio::test]
    async fn take_line_consumes_terminator() {
        let mut p = buffer(b"12ab\r\nrest", 64);
        let line = p.take_line().await.unwrap();
        assert_eq!(&line[..], b"12ab\r\n");
        assert_eq!(p.buffered(), b"rest");
    }

    #[tokio::test]
    async fn take_line_eof_is_error() {
        let mut p = buffer(b"no newline", 64);
        assert!(p.take_line().await.is_err());
    }

    #[tokio::test]
    async fn into_parts_returns_remainder() {
        let mut p = buffer(b"hello world", 5);
        p.fill().await.unwrap();
        p.consume(5);
        p.fill().await.unwrap();
        let (rest, _inner) = p.into_parts();
        assert_eq!(&rest[..], b" worl");
    }
}
