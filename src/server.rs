//! The proxy server: accept loop and CONNECT dispatcher.
//!
//! Every accepted connection is handled in its own task. The first request
//! head decides the path: CONNECT tunnels are elected for raw forwarding,
//! TLS interception or rejection; everything else goes through the plain
//! request router.

use std::sync::Arc;

use http::StatusCode;
use n0_error::{Result, StdResultExt, anyerr};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    CertificateAuthority, ConfigStore, HEADER_SECTION_MAX_LENGTH, HttpRequest, HttpResponse,
    PidRegistry, ProjectResolver, ProxyError,
    intercept::Intercept,
    parse::{Authority, RequestKind},
    project::Project,
    router::Router,
    util::{PeekBuffer, forward_bidi},
};

/// What to do with an accepted CONNECT tunnel.
enum Connect {
    /// Forward raw bytes to this address.
    Tunnel(String),
    /// Terminate TLS; `Some` carries the loopback backend of a running
    /// project, `None` means the engine only serves an error page.
    Intercept(Option<String>),
}

/// The proxy engine.
pub struct Proxy {
    config: Arc<ConfigStore>,
    resolver: ProjectResolver,
    router: Router,
    ca_roots: Option<rustls::RootCertStore>,
    server_tls: Option<Arc<rustls::ServerConfig>>,
}

impl Proxy {
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<dyn PidRegistry>,
        ca: Option<Arc<CertificateAuthority>>,
    ) -> Self {
        let resolver = ProjectResolver::new(config.clone(), registry);
        let router = Router::new(config.clone(), resolver.clone());
        let (ca_roots, server_tls) = match ca {
            Some(ca) => (Some(ca.root_store()), Some(ca.server_config())),
            None => (None, None),
        };
        Self {
            config,
            resolver,
            router,
            ca_roots,
            server_tls,
        }
    }

    /// Binds the configured listen address, spawns the configuration
    /// watcher and serves until the listener fails.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .std_context("unable to bind proxy listen address")?;
        info!("proxy listening on {addr}");
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || config.watch());
        self.serve(listener).await
    }

    /// Accepts connections from the listener, each handled in a new task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut conn_id = 0u64;
        loop {
            let (stream, client_addr) = listener.accept().await.anyerr()?;
            conn_id += 1;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted connection");
                        match this.handle_connection(stream).await {
                            Ok(()) => debug!("connection closed"),
                            Err(err) => warn!("connection closed with error: {err:#}"),
                        }
                    })
                    .instrument(error_span!("conn", id = %conn_id)),
            );
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ProxyError> {
        let (recv, mut send) = stream.into_split();
        let mut recv = PeekBuffer::new(recv, HEADER_SECTION_MAX_LENGTH);
        let req = match HttpRequest::read(&mut recv).await {
            Ok(req) => req,
            Err(err) => {
                HttpResponse::write_with_body(
                    &mut send,
                    StatusCode::BAD_REQUEST,
                    "text/plain; charset=utf-8",
                    b"Bad Request\n",
                )
                .await
                .ok();
                return Err(ProxyError::bad_request(err));
            }
        };
        debug!(method = %req.method, uri = %req.target, "read request");
        match req.kind() {
            Ok(RequestKind::Connect(target)) => self.dispatch_connect(target, recv, send).await,
            _ => self.router.handle(req, &mut recv, &mut send).await,
        }
    }

    /// Decides, per CONNECT tunnel, whether to terminate TLS, forward raw
    /// bytes, or reject.
    async fn dispatch_connect(
        &self,
        target: Authority,
        recv: PeekBuffer<OwnedReadHalf>,
        mut send: OwnedWriteHalf,
    ) -> Result<(), ProxyError> {
        match self.elect(&target) {
            Connect::Tunnel(backend) => self.tunnel(recv, send, &backend).await,
            Connect::Intercept(backend) => {
                let (Some(server_config), Some(ca_roots)) = (&self.server_tls, &self.ca_roots)
                else {
                    // Without a CA there is nothing to terminate TLS with.
                    debug!(tunnel = %target, "no CA configured, rejecting CONNECT");
                    let err = ProxyError::bad_gateway(anyerr!(
                        "no certificate authority configured for {target}"
                    ));
                    err.write_response(&mut send).await?;
                    return Ok(());
                };
                let intercept = Intercept {
                    server_config: server_config.clone(),
                    ca_roots: ca_roots.clone(),
                    config: self.config.clone(),
                    resolver: self.resolver.clone(),
                    connect_target: target,
                    backend,
                };
                intercept.run(recv, send).await
            }
        }
    }

    fn elect(&self, target: &Authority) -> Connect {
        if !self.config.tld_matches(&target.host) {
            // Out-of-scope host: behave like a regular forward proxy.
            return Connect::Tunnel(target.to_addr());
        }
        match self.resolver.resolve(&target.host) {
            // Intercept so the engine can answer with a friendly page.
            Project::NotLinked | Project::NotRunning { .. } => Connect::Intercept(None),
            Project::Running { port, .. } => {
                let backend = format!("127.0.0.1:{port}");
                if target.port != 443 {
                    // No TLS termination required on other ports.
                    Connect::Tunnel(backend)
                } else {
                    Connect::Intercept(Some(backend))
                }
            }
        }
    }

    /// Raw byte tunnel: dial, acknowledge, pump.
    async fn tunnel(
        &self,
        mut recv: PeekBuffer<OwnedReadHalf>,
        mut send: OwnedWriteHalf,
        backend: &str,
    ) -> Result<(), ProxyError> {
        let tcp = match TcpStream::connect(backend).await {
            Ok(tcp) => tcp,
            Err(err) => {
                warn!(%backend, "failed to dial tunnel target: {err:#}");
                let err = ProxyError::bad_gateway(err);
                err.write_response(&mut send).await?;
                return Ok(());
            }
        };
        send.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await?;
        let (mut backend_recv, mut backend_send) = tcp.into_split();
        let (up, down) = forward_bidi(&mut recv, &mut send, &mut backend_recv, &mut backend_send)
            .await
            .map_err(ProxyError::io)?;
        debug!(up, down, "tunnel closed");
        Ok(())
    }
}
