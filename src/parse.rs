use std::str::FromStr;

use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::PeekBuffer;

/// Host and port parsed from an HTTP request target.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_connect_target(s)
    }
}

impl Authority {
    /// Parses an authority-form CONNECT target.
    ///
    /// A missing port defaults to 443, the only scheme a CONNECT tunnel
    /// implies.
    pub fn from_connect_target(s: &str) -> Result<Self> {
        let uri = Uri::from_str(s).std_context("Invalid authority string")?;
        let authority = uri.authority().context("Expected target with authority")?;
        Ok(Self {
            host: authority.host().to_string(),
            port: authority.port_u16().unwrap_or(443),
        })
    }

    /// Parses an absolute-form URI and infers the port from the scheme.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("Expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request target classification per RFC 9110.
#[derive(Debug)]
pub enum RequestKind {
    /// CONNECT tunnel with an authority-form target.
    Connect(Authority),
    /// Forward-proxy request with an absolute-form target.
    Absolute(Uri),
    /// Direct origin request with an origin-form path.
    Origin { path: String },
}

/// A parsed HTTP/1.x request head.
///
/// The target and headers are mutable so backend rules can rewrite them
/// before the head is serialized back to the wire with [`write_head`].
///
/// [`write_head`]: HttpRequest::write_head
#[derive(Debug)]
pub struct HttpRequest {
    /// HTTP method from the request line.
    pub method: Method,
    /// Raw request target as received (or as rewritten).
    pub target: String,
    /// Header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpRequest {
    /// Reads and parses the request line and header section.
    ///
    /// Does not remove the header section from `reader`. Returns the length
    /// of the header section and the request.
    pub(crate) async fn peek(
        reader: &mut PeekBuffer<impl AsyncRead + Unpin>,
    ) -> Result<(usize, Self)> {
        loop {
            if let Some(request) = Self::parse_with_len(reader.buffered())? {
                return Ok(request);
            }
            if reader.at_limit() || reader.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "end of input before end of request header section",
                )
                .into());
            }
        }
    }

    /// Reads and parses the request line and header section, consuming it.
    pub(crate) async fn read(reader: &mut PeekBuffer<impl AsyncRead + Unpin>) -> Result<Self> {
        let (len, request) = Self::peek(reader).await?;
        reader.consume(len);
        Ok(request)
    }

    /// Parses a request head from a buffer, `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method: Method = req
                    .method
                    .context("Missing HTTP method")?
                    .parse()
                    .std_context("Invalid HTTP method")?;
                let target = req.path.context("Missing request target")?.to_string();
                let headers = HeaderMap::from_iter(req.headers.iter_mut().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        target,
                        headers,
                    },
                )))
            }
        }
    }

    /// Classifies the request target.
    pub fn kind(&self) -> Result<RequestKind> {
        if self.method == Method::CONNECT {
            return Ok(RequestKind::Connect(Authority::from_connect_target(
                &self.target,
            )?));
        }
        let uri = Uri::from_str(&self.target).std_context("Invalid request target")?;
        if uri.scheme().is_some() {
            Ok(RequestKind::Absolute(uri))
        } else {
            Ok(RequestKind::Origin {
                path: self.target.clone(),
            })
        }
    }

    /// The `Host` header, if present and valid UTF-8.
    pub fn host(&self) -> Option<&str> {
        self.headers.get(http::header::HOST).and_then(|v| v.to_str().ok())
    }

    /// Replaces the `Host` header.
    pub fn set_host(&mut self, host: &str) {
        if let Ok(value) = HeaderValue::from_str(host) {
            self.headers.insert(http::header::HOST, value);
        }
    }

    /// Serializes the request line and header section.
    pub(crate) async fn write_head(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        let line = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        writer.write_all(line.as_bytes()).await?;
        for (name, value) in self.headers.iter() {
            writer.write_all(name.as_str().as_bytes()).await?;
            writer.write_all(b": ").await?;
            writer.write_all(value.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer.write_all(b"\r\n").await
    }
}

/// A parsed HTTP/1.x response head.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpResponse {
    pub(crate) fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    /// Returns the reason phrase or the canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Parses a response head from a buffer, `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("Invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the response status line and header section,
    /// consuming it.
    pub(crate) async fn read(reader: &mut PeekBuffer<impl AsyncRead + Unpin>) -> Result<Self> {
        loop {
            if let Some((len, response)) = Self::parse_with_len(reader.buffered())? {
                reader.consume(len);
                return Ok(response);
            }
            if reader.at_limit() || reader.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "end of input before end of response header section",
                )
                .into());
            }
        }
    }

    /// Serializes the status line and header section.
    pub(crate) async fn write_head(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        writer.write_all(self.status_line().as_bytes()).await?;
        for (name, value) in self.headers.iter() {
            writer.write_all(name.as_str().as_bytes()).await?;
            writer.write_all(b": ").await?;
            writer.write_all(value.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer.write_all(b"\r\n").await
    }

    /// Writes a complete response with the given body and `Connection:
    /// close` semantics.
    pub(crate) async fn write_with_body(
        writer: &mut (impl AsyncWrite + Send + Unpin),
        status: StatusCode,
        content_type: &str,
        body: &[u8],
    ) -> io::Result<()> {
        let mut response = Self::new(status);
        response
            .headers
            .insert(http::header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        response.headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&body.len().to_string()).unwrap(),
        );
        response
            .headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        response.write_head(writer).await?;
        writer.write_all(body).await?;
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::PeekBuffer;

    #[test]
    fn parse_partial_request_is_none() {
        assert!(
            HttpRequest::parse_with_len(b"GET /foo HTTP/1.1\r\nHost: ex")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn parse_origin_form() {
        let (len, req) =
            HttpRequest::parse_with_len(b"GET /star/x HTTP/1.1\r\nHost: example.wip\r\n\r\nrest")
                .unwrap()
                .unwrap();
        assert_eq!(len, 43);
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.host(), Some("example.wip"));
        assert!(matches!(req.kind().unwrap(), RequestKind::Origin { path } if path == "/star/x"));
    }

    #[test]
    fn parse_connect_defaults_to_443() {
        let (_, req) = HttpRequest::parse_with_len(b"CONNECT example.wip HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        match req.kind().unwrap() {
            RequestKind::Connect(authority) => {
                assert_eq!(authority.host, "example.wip");
                assert_eq!(authority.port, 443);
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    #[test]
    fn parse_absolute_form() {
        let (_, req) =
            HttpRequest::parse_with_len(b"GET http://example.wip:8080/a HTTP/1.1\r\n\r\n")
                .unwrap()
                .unwrap();
        match req.kind().unwrap() {
            RequestKind::Absolute(uri) => {
                let authority = Authority::from_absolute_uri(&uri).unwrap();
                assert_eq!(authority.to_addr(), "example.wip:8080");
            }
            other => panic!("expected absolute form, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_leaves_body_bytes() {
        let data: &[u8] = b"POST /p HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = PeekBuffer::new(data, 8192);
        let req = HttpRequest::read(&mut reader).await.unwrap();
        assert_eq!(req.method, Method::POST);
        let (rest, _) = reader.into_parts();
        assert_eq!(&rest[..], b"body");
    }

    #[tokio::test]
    async fn response_round_trip() {
        let data: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let mut reader = PeekBuffer::new(data, 8192);
        let res = HttpResponse::read(&mut reader).await.unwrap();
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(res.reason(), "Not Found");

        let mut out = Vec::new();
        res.write_head(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }
}
