//! The TLS interception engine.
//!
//! Given an accepted CONNECT tunnel elected for interception, terminates
//! the client's TLS with a certificate minted for the requested SNI, reads
//! one HTTP request from the decrypted stream, runs the same backend-rule
//! matching as the plain path, dials the chosen backend (plain or TLS) and
//! pumps request and response concurrently.
//!
//! The engine intentionally proxies at the HTTP-message level rather than
//! splicing bytes: rules rewrite Host and path after TLS termination,
//! which a transparent TCP splice could not do.

use std::{net::SocketAddr, sync::Arc};

use http::{HeaderValue, StatusCode};
use n0_error::{Result, StackResultExt, StdResultExt};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::{
    ConfigStore, HEADER_SECTION_MAX_LENGTH, HttpRequest, HttpResponse, ProjectResolver,
    ProxyError, VIA_HEADER, VIA_VALUE, body, ca,
    pages,
    parse::Authority,
    project::Project,
    util::PeekBuffer,
};

/// Everything the engine needs for one intercepted tunnel.
pub(crate) struct Intercept {
    pub server_config: Arc<rustls::ServerConfig>,
    /// Trust anchors of the local CA, used when dialing `localhost`.
    pub ca_roots: rustls::RootCertStore,
    pub config: Arc<ConfigStore>,
    pub resolver: ProjectResolver,
    /// The CONNECT target as requested by the client.
    pub connect_target: Authority,
    /// Loopback backend when the project is linked and running; `None`
    /// when the tunnel was elected for interception to serve an error
    /// page.
    pub backend: Option<String>,
}

/// First five bytes of the common plaintext HTTP methods. A client that
/// sends these into the supposedly-TLS tunnel spoke HTTP to an HTTPS
/// server.
fn looks_like_http(head: &[u8]) -> bool {
    matches!(
        head.get(..5),
        Some(b"GET /") | Some(b"HEAD ") | Some(b"POST ") | Some(b"PUT /") | Some(b"OPTIO")
    )
}

impl Intercept {
    /// Runs the engine on the raw client connection.
    ///
    /// The CONNECT header section has already been consumed from
    /// `client_recv`.
    pub(crate) async fn run(
        self,
        mut client_recv: PeekBuffer<impl AsyncRead + Send + Unpin>,
        mut client_send: impl AsyncWrite + Send + Unpin,
    ) -> Result<(), ProxyError> {
        // Acknowledge the CONNECT before the handshake.
        client_send.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await?;
        client_send.flush().await?;

        let head = client_recv.peek_at_least(5).await?;
        if looks_like_http(head) {
            client_send
                .write_all(
                    b"HTTP/1.0 400 Bad Request\r\n\r\nClient sent an HTTP request to an HTTPS server.\n",
                )
                .await?;
            return Ok(());
        }

        let acceptor = TlsAcceptor::from(self.server_config.clone());
        let tls = match acceptor
            .accept(tokio::io::join(client_recv, client_send))
            .await
        {
            Ok(tls) => tls,
            Err(err) => {
                debug!(tunnel = %self.connect_target, "TLS handshake error from client: {err:#}");
                return Ok(());
            }
        };
        let negotiated = tls
            .get_ref()
            .1
            .alpn_protocol()
            .map(|proto| proto.to_vec())
            .unwrap_or_else(|| b"http/1.1".to_vec());

        let (tls_recv, mut tls_send) = tokio::io::split(tls);
        let mut tls_recv = PeekBuffer::new(tls_recv, HEADER_SECTION_MAX_LENGTH);

        let mut req = match HttpRequest::read(&mut tls_recv).await {
            Ok(req) => req,
            Err(err) => {
                debug!("problem reading request from decrypted stream: {err:#}");
                return Ok(());
            }
        };

        // Every request in the tunnel is https until a rule says otherwise.
        let mut scheme = "https".to_string();
        let mut domain = "localhost".to_string();
        let mut ip_and_port = self.backend.clone();

        let tld = self.config.tld();
        let host = req.host().unwrap_or_default().to_string();
        let path = req.target.clone();
        for rule in self.config.backends() {
            if !rule.matches(&host, &path, &tld) {
                continue;
            }
            debug!(prefix = %rule.prefix(&tld), "backend rule matched in tunnel");
            let target = match rule.rewrite(&path) {
                Ok(target) => target,
                Err(err) => {
                    warn!("backend rewrite failed: {err:#}");
                    tls_send
                        .write_all(b"HTTP/1.1 500 Internal Server Error\r\n\r\n")
                        .await?;
                    return Ok(());
                }
            };
            match resolve_backend(&target.host, target.port).await {
                Ok(addr) => ip_and_port = Some(addr),
                Err(err) => {
                    warn!(host = %target.host, "backend lookup failed: {err:#}");
                    return Ok(());
                }
            }
            domain = target.host.clone();
            scheme = target.scheme.clone();
            req.target = target.path_and_query.clone();
            req.set_host(&target.host_header);
            req.headers
                .append(VIA_HEADER, HeaderValue::from_static(VIA_VALUE));
            break;
        }

        // HTTP/2 is not served; abort the client preface without closing.
        if req.method.as_str() == "PRI" {
            debug!("client sent an HTTP/2 preface, not implemented");
            tls_send
                .write_all(b"HTTP/1.1 501 Not Implemented\r\n\r\n")
                .await?;
            let mut preface = [0u8; 6];
            tls_recv.read_exact(&mut preface).await.ok();
            return Ok(());
        }

        // No rule matched and no running project behind the tunnel: the
        // engine exists here only to answer with a friendly page.
        let Some(ip_and_port) = ip_and_port else {
            return self.serve_error_page(&req, &mut tls_send).await;
        };

        let tcp = match TcpStream::connect(&ip_and_port).await {
            Ok(tcp) => tcp,
            Err(err) => {
                warn!(%ip_and_port, "failed to dial backend: {err:#}");
                let err = ProxyError::bad_gateway(err);
                err.write_response(&mut tls_send).await?;
                return Ok(());
            }
        };

        let (backend_recv, mut backend_send): (
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        ) = if scheme == "https" {
            let roots = if domain == "localhost" {
                self.ca_roots.clone()
            } else {
                ca::system_roots()
            };
            let connector =
                TlsConnector::from(ca::upstream_client_config(roots, vec![negotiated.clone()]));
            let server_name = match ServerName::try_from(domain.clone()) {
                Ok(name) => name,
                Err(err) => {
                    warn!(%domain, "invalid backend server name: {err}");
                    let err = ProxyError::bad_gateway(n0_error::anyerr!(err));
                    err.write_response(&mut tls_send).await?;
                    return Ok(());
                }
            };
            match connector.connect(server_name, tcp).await {
                Ok(tls) => {
                    let (recv, send) = tokio::io::split(tls);
                    (Box::new(recv), Box::new(send))
                }
                Err(err) => {
                    warn!(%domain, "cannot handshake backend: {err:#}");
                    let err = ProxyError::bad_gateway(err);
                    err.write_response(&mut tls_send).await?;
                    return Ok(());
                }
            }
        } else {
            let (recv, send) = tcp.into_split();
            (Box::new(recv), Box::new(send))
        };

        let mut backend_recv = PeekBuffer::new(backend_recv, HEADER_SECTION_MAX_LENGTH);
        let request_framing = body::request_framing(&req.headers);
        let method = req.method.clone();

        // Pump both directions; an error on one side does not abort the
        // other.
        let (up, down) = tokio::join!(
            async {
                req.write_head(&mut backend_send).await.anyerr()?;
                body::forward(request_framing, &mut tls_recv, &mut backend_send).await?;
                backend_send.flush().await.anyerr()?;
                Ok::<_, n0_error::AnyError>(())
            },
            async {
                let response = HttpResponse::read(&mut backend_recv).await?;
                let framing = body::response_framing(&method, response.status, &response.headers);
                response.write_head(&mut tls_send).await.anyerr()?;
                body::forward(framing, &mut backend_recv, &mut tls_send).await?;
                tls_send.flush().await.anyerr()?;
                Ok::<_, n0_error::AnyError>(())
            }
        );
        if let Err(err) = up {
            debug!("client-to-backend direction failed: {err:#}");
        }
        if let Err(err) = down {
            debug!("backend-to-client direction failed: {err:#}");
        }

        tls_send.shutdown().await.ok();
        Ok(())
    }

    /// Answers the decrypted request with the page the plain path would
    /// have produced.
    async fn serve_error_page(
        &self,
        req: &HttpRequest,
        tls_send: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<(), ProxyError> {
        let tld = self.config.tld();
        let host_name = req
            .host()
            .map(|host| host.split(':').next().unwrap_or(host).to_string())
            .unwrap_or_else(|| self.connect_target.host.clone());

        let page = if self.connect_target.port != 443 {
            pages::wrong_port_page("https", &host_name, self.connect_target.port)
        } else {
            match self.resolver.resolve(&host_name) {
                Project::NotLinked => pages::not_linked_page(&host_name, &tld),
                Project::NotRunning { dir } | Project::Running { dir, .. } => {
                    // A server that raced into running state since dispatch
                    // is told to retry as well.
                    pages::not_started_page(&host_name, &dir)
                }
            }
        };
        HttpResponse::write_with_body(
            tls_send,
            StatusCode::NOT_FOUND,
            "text/html; charset=utf-8",
            page.as_bytes(),
        )
        .await?;
        tls_send.shutdown().await.ok();
        Ok(())
    }
}

/// Resolves a rewritten backend host, preferring IPv4 and falling back to
/// IPv6.
async fn resolve_backend(host: &str, port: u16) -> Result<String> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .anyerr()?
        .collect();
    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .context("no address found for backend host")?;
    Ok(addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_detection_matches_the_five_byte_heuristic() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"HEAD / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"POST /x HTTP/1.1\r\n"));
        assert!(looks_like_http(b"PUT / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"OPTIONS * HTTP/1.1\r\n"));
        assert!(!looks_like_http(b"\x16\x03\x01\x02\x00"));
        assert!(!looks_like_http(b"PU"));
        // PATCH happens to not be part of the heuristic.
        assert!(!looks_like_http(b"PATCH / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn backend_resolution_prefers_ipv4() {
        let addr = resolve_backend("localhost", 8080).await.unwrap();
        assert!(addr == "127.0.0.1:8080" || addr == "[::1]:8080");
    }
}
