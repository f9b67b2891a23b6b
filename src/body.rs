//! HTTP/1 message body framing.
//!
//! The interception engine proxies at the message level, so it has to know
//! where a body ends in order to release the connection. Bodies are
//! forwarded verbatim; chunked bodies keep their chunk structure on the
//! wire.

use http::{HeaderMap, Method, StatusCode};
use n0_error::{Result, StdResultExt, anyerr, ensure_any};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::PeekBuffer;

/// How the end of a message body is determined, per RFC 9112 section 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body.
    None,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Body runs until the peer closes the connection.
    Close,
}

pub(crate) fn request_framing(headers: &HeaderMap) -> Framing {
    if is_chunked(headers) {
        Framing::Chunked
    } else {
        match content_length(headers) {
            Some(0) | None => Framing::None,
            Some(len) => Framing::Length(len),
        }
    }
}

pub(crate) fn response_framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Framing {
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        Framing::None
    } else if is_chunked(headers) {
        Framing::Chunked
    } else if let Some(len) = content_length(headers) {
        Framing::Length(len)
    } else {
        Framing::Close
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

/// Forwards a message body verbatim from `reader` to `writer`.
///
/// Returns the number of body bytes forwarded.
pub(crate) async fn forward(
    framing: Framing,
    reader: &mut PeekBuffer<impl AsyncRead + Unpin>,
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<u64> {
    match framing {
        Framing::None => Ok(0),
        Framing::Length(len) => copy_exact(reader, writer, len).await,
        Framing::Close => Ok(tokio::io::copy(reader, writer).await.anyerr()?),
        Framing::Chunked => forward_chunked(reader, writer).await,
    }
}

async fn copy_exact(
    reader: &mut PeekBuffer<impl AsyncRead + Unpin>,
    writer: &mut (impl AsyncWrite + Send + Unpin),
    len: u64,
) -> Result<u64> {
    let mut limited = (&mut *reader).take(len);
    let copied = tokio::io::copy(&mut limited, writer).await.anyerr()?;
    ensure_any!(copied == len, "unexpected eof in message body");
    Ok(copied)
}

async fn forward_chunked(
    reader: &mut PeekBuffer<impl AsyncRead + Unpin>,
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let line = reader.take_line().await.anyerr()?;
        writer.write_all(&line).await.anyerr()?;
        total += line.len() as u64;
        let size = chunk_size(&line)?;
        if size == 0 {
            // Trailer section, terminated by an empty line.
            loop {
                let line = reader.take_line().await.anyerr()?;
                writer.write_all(&line).await.anyerr()?;
                total += line.len() as u64;
                if line == b"\r\n"[..] || line == b"\n"[..] {
                    return Ok(total);
                }
            }
        }
        // Chunk data plus its trailing CRLF.
        total += copy_exact(reader, writer, size + 2).await?;
    }
}

fn chunk_size(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line)
        .std_context("invalid chunk size line")?
        .trim_end_matches(['\r', '\n']);
    let hex = line.split(';').next().unwrap_or(line).trim();
    u64::from_str_radix(hex, 16).map_err(|_| anyerr!("invalid chunk size {line:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (k.parse().unwrap(), v.parse().unwrap()))
            .collect()
    }

    async fn forward_all(framing: Framing, input: &'static [u8]) -> (Vec<u8>, u64) {
        let mut reader = PeekBuffer::new(input, 8192);
        let mut out = Vec::new();
        let n = forward(framing, &mut reader, &mut out).await.unwrap();
        (out, n)
    }

    #[test]
    fn request_framing_rules() {
        assert_eq!(request_framing(&headers(&[])), Framing::None);
        assert_eq!(
            request_framing(&headers(&[("content-length", "0")])),
            Framing::None
        );
        assert_eq!(
            request_framing(&headers(&[("content-length", "12")])),
            Framing::Length(12)
        );
        assert_eq!(
            request_framing(&headers(&[("transfer-encoding", "chunked")])),
            Framing::Chunked
        );
    }

    #[test]
    fn response_framing_rules() {
        assert_eq!(
            response_framing(&Method::HEAD, StatusCode::OK, &headers(&[("content-length", "5")])),
            Framing::None
        );
        assert_eq!(
            response_framing(&Method::GET, StatusCode::NO_CONTENT, &headers(&[])),
            Framing::None
        );
        assert_eq!(
            response_framing(&Method::GET, StatusCode::OK, &headers(&[("content-length", "5")])),
            Framing::Length(5)
        );
        assert_eq!(
            response_framing(&Method::GET, StatusCode::OK, &headers(&[])),
            Framing::Close
        );
    }

    #[tokio::test]
    async fn forward_length_is_exact() {
        let (out, n) = forward_all(Framing::Length(4), b"bodyEXTRA").await;
        assert_eq!(out, b"body");
        assert_eq!(n, 4);
    }

    #[tokio::test]
    async fn forward_length_eof_is_error() {
        let mut reader = PeekBuffer::new(&b"ab"[..], 8192);
        let mut out = Vec::new();
        assert!(forward(Framing::Length(4), &mut reader, &mut out).await.is_err());
    }

    #[tokio::test]
    async fn forward_chunked_keeps_wire_format() {
        let input: &[u8] = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\nNEXT";
        let (out, _) = forward_all(Framing::Chunked, input).await;
        assert_eq!(out, b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn forward_chunked_with_trailers() {
        let input: &[u8] = b"3\r\nabc\r\n0\r\nExpires: never\r\n\r\n";
        let (out, _) = forward_all(Framing::Chunked, input).await;
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn forward_close_reads_to_eof() {
        let (out, n) = forward_all(Framing::Close, b"everything").await;
        assert_eq!(out, b"everything");
        assert_eq!(n, 10);
    }
}
