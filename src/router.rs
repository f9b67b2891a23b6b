//! The plain-HTTP request path.
//!
//! Absolute-form requests for TLD hostnames are swept against the backend
//! rules, checked for port sanity and resolved to a linked project; every
//! other absolute-form request is forwarded untouched, and origin-form
//! requests are the proxy's own surface (PAC file and dashboard).

use http::{HeaderValue, StatusCode, Uri, header};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    ConfigStore, HttpRequest, HttpResponse, ProjectResolver, ProxyError, VIA_HEADER, VIA_VALUE,
    body,
    pages,
    parse::{Authority, RequestKind},
    project::Project,
    util::PeekBuffer,
};
use std::sync::Arc;

/// Routes one plain (non-CONNECT) proxied request.
#[derive(Clone)]
pub struct Router {
    config: Arc<ConfigStore>,
    resolver: ProjectResolver,
    client: reqwest::Client,
}

impl Router {
    pub fn new(config: Arc<ConfigStore>, resolver: ProjectResolver) -> Self {
        Self {
            config,
            resolver,
            client: reqwest::Client::new(),
        }
    }

    /// Handles a parsed request whose body (if any) is still in `reader`.
    ///
    /// One request per connection; every response closes the stream.
    pub(crate) async fn handle(
        &self,
        req: HttpRequest,
        reader: &mut PeekBuffer<impl AsyncRead + Unpin>,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<(), ProxyError> {
        match req.kind() {
            Ok(RequestKind::Origin { path }) => self.serve_builtin(&req, &path, writer).await,
            Ok(RequestKind::Absolute(uri)) => self.route_absolute(req, uri, reader, writer).await,
            Ok(RequestKind::Connect(_)) => Err(ProxyError::bad_request(n0_error::anyerr!(
                "CONNECT is handled before the router"
            ))),
            Err(err) => {
                HttpResponse::write_with_body(
                    writer,
                    StatusCode::BAD_REQUEST,
                    "text/plain; charset=utf-8",
                    b"Bad Request\n",
                )
                .await?;
                Err(ProxyError::bad_request(err))
            }
        }
    }

    /// The proxy's own endpoints, reached with origin-form requests.
    async fn serve_builtin(
        &self,
        req: &HttpRequest,
        path: &str,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<(), ProxyError> {
        let Some(host) = req.host().filter(|host| !host.is_empty()) else {
            HttpResponse::write_with_body(
                writer,
                StatusCode::OK,
                "text/plain; charset=utf-8",
                b"Cannot handle requests without a Host header, e.g. HTTP 1.0\n",
            )
            .await?;
            return Ok(());
        };
        match path {
            "/proxy.pac" => {
                let pac = pages::pac_file(&self.config.tld(), host);
                HttpResponse::write_with_body(
                    writer,
                    StatusCode::OK,
                    "application/x-ns-proxy-autoconfig",
                    pac.as_bytes(),
                )
                .await?;
            }
            "/" => {
                let index = pages::index_page(&self.config, self.resolver.registry().as_ref());
                html_response(writer, StatusCode::OK, &index).await?;
            }
            _ => {
                HttpResponse::write_with_body(
                    writer,
                    StatusCode::NOT_FOUND,
                    "text/plain; charset=utf-8",
                    b"Not Found\n",
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn route_absolute(
        &self,
        mut req: HttpRequest,
        uri: Uri,
        reader: &mut PeekBuffer<impl AsyncRead + Unpin>,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<(), ProxyError> {
        let authority = match Authority::from_absolute_uri(&uri) {
            Ok(authority) => authority,
            Err(err) => {
                HttpResponse::write_with_body(
                    writer,
                    StatusCode::BAD_REQUEST,
                    "text/plain; charset=utf-8",
                    b"Bad Request\n",
                )
                .await?;
                return Err(ProxyError::bad_request(err));
            }
        };
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let host_with_port = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        if !self.config.tld_matches(&authority.host) {
            // Ordinary forward-proxy request for the outside world.
            debug!(url = %uri, "forwarding outside request");
            return self
                .forward(req, uri.to_string(), None, reader, writer)
                .await;
        }

        // Rule sweep, first match wins.
        let tld = self.config.tld();
        for rule in self.config.backends() {
            if !rule.matches(&host_with_port, uri.path(), &tld) {
                continue;
            }
            debug!(prefix = %rule.prefix(&tld), "backend rule matched");
            let target = match rule.rewrite(&path_and_query) {
                Ok(target) => target,
                Err(err) => {
                    warn!("backend rewrite failed: {err:#}");
                    html_response(
                        writer,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &pages::wrap_html(
                            "Proxy Error",
                            &pages::error_terminal("The backend rewrite produced an invalid URL"),
                        ),
                    )
                    .await?;
                    return Ok(());
                }
            };
            req.set_host(&target.host_header);
            req.headers
                .append(VIA_HEADER, HeaderValue::from_static(VIA_VALUE));
            return self.forward(req, target.url(), None, reader, writer).await;
        }

        // Port sanity for the made-up TLD.
        let expected = if scheme == "https" { 443 } else { 80 };
        if authority.port != expected {
            html_response(
                writer,
                StatusCode::NOT_FOUND,
                &pages::wrong_port_page(&scheme, &authority.host, authority.port),
            )
            .await?;
            return Ok(());
        }

        match self.resolver.resolve(&authority.host) {
            Project::NotLinked => {
                html_response(
                    writer,
                    StatusCode::NOT_FOUND,
                    &pages::not_linked_page(&authority.host, &tld),
                )
                .await?;
                Ok(())
            }
            Project::NotRunning { dir } => {
                html_response(
                    writer,
                    StatusCode::NOT_FOUND,
                    &pages::not_started_page(&authority.host, &dir),
                )
                .await?;
                Ok(())
            }
            Project::Running { port, .. } => {
                let url = format!("http://127.0.0.1:{port}{path_and_query}");
                if !req.headers.contains_key("x-forwarded-port") {
                    req.headers.insert(
                        "x-forwarded-port",
                        HeaderValue::from_str(&authority.port.to_string())
                            .expect("port is a valid header value"),
                    );
                }
                self.forward(req, url, Some(&host_with_port), reader, writer)
                    .await
            }
        }
    }

    /// Executes the (possibly rewritten) request and streams the response
    /// back over the raw socket.
    async fn forward(
        &self,
        req: HttpRequest,
        url: String,
        host_override: Option<&str>,
        reader: &mut PeekBuffer<impl AsyncRead + Unpin>,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> Result<(), ProxyError> {
        let framing = body::request_framing(&req.headers);
        let mut request_body = Vec::new();
        body::forward(framing, reader, &mut request_body)
            .await
            .map_err(ProxyError::bad_request)?;

        let mut headers = req.headers.clone();
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);
        headers.remove("proxy-connection");
        if let Some(host) = host_override
            && let Ok(value) = HeaderValue::from_str(host)
        {
            headers.insert(header::HOST, value);
        }

        let response = match self
            .client
            .request(req.method.clone(), url.as_str())
            .headers(headers)
            .body(request_body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(%url, "failed to reach backend: {err:#}");
                HttpResponse::write_with_body(
                    writer,
                    StatusCode::BAD_GATEWAY,
                    "text/plain; charset=utf-8",
                    b"Bad Gateway\n",
                )
                .await?;
                return Ok(());
            }
        };

        let mut head = HttpResponse::new(response.status());
        for (name, value) in response.headers() {
            if name == &header::TRANSFER_ENCODING || name == &header::CONNECTION {
                continue;
            }
            head.headers.append(name.clone(), value.clone());
        }
        head.headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        head.write_head(writer).await?;

        let mut response = response;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => writer.write_all(&chunk).await?,
                Ok(None) => break,
                Err(err) => return Err(ProxyError::io(n0_error::anyerr!(err))),
            }
        }
        writer.flush().await?;
        writer.shutdown().await.ok();
        Ok(())
    }
}

async fn html_response(
    writer: &mut (impl AsyncWrite + Send + Unpin),
    status: StatusCode,
    body: &str,
) -> std::io::Result<()> {
    HttpResponse::write_with_body(writer, status, "text/html; charset=utf-8", body.as_bytes()).await
}
