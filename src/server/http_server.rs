use crate::logging::ERRORS;
use crate::server::request_handler::{RequestHandler, Scheme};
use crate::server::tls::CertificateStore;
use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// The plaintext and TLS listeners. Both hand every request to the same
/// [`RequestHandler`]; only the scheme they report differs.
pub struct HttpServer {
    handler: Arc<RequestHandler>,
    certificates: Arc<CertificateStore>,
}

impl HttpServer {
    pub fn new(handler: Arc<RequestHandler>, certificates: Arc<CertificateStore>) -> Self {
        Self {
            handler,
            certificates,
        }
    }

    /// Binds both listeners and serves until SIGINT, SIGTERM or SIGQUIT.
    pub async fn run(self, http_addr: SocketAddr, https_addr: SocketAddr) -> Result<()> {
        let http = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener to {}", http_addr))?;
        let https = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener to {}", https_addr))?;

        info!("Listening for HTTP on {}", http_addr);
        info!("Listening for HTTPS on {}", https_addr);

        self.serve(http, https, wait_for_signal()).await;
        info!("Server stopped");
        Ok(())
    }

    /// Serves already-bound listeners until `shutdown` completes.
    pub async fn serve<F>(self, http: TcpListener, https: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let acceptor = self.certificates.acceptor();

        let mut plain = tokio::spawn(Self::serve_listener(http, self.handler.clone(), None));
        let mut secure = tokio::spawn(Self::serve_listener(
            https,
            self.handler.clone(),
            Some(acceptor),
        ));

        tokio::select! {
            result = &mut plain => error!(target: ERRORS, "HTTP listener task ended: {:?}", result),
            result = &mut secure => error!(target: ERRORS, "HTTPS listener task ended: {:?}", result),
            _ = shutdown => info!("Received shutdown signal, stopping listeners"),
        }

        plain.abort();
        secure.abort();
    }

    async fn serve_listener(
        listener: TcpListener,
        handler: Arc<RequestHandler>,
        acceptor: Option<TlsAcceptor>,
    ) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(target: ERRORS, "Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let handler = handler.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, handler, acceptor).await {
                    debug!("Connection from {} ended with error: {:#}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<RequestHandler>,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;

        match acceptor {
            Some(acceptor) => {
                let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                    .await
                    .context("TLS handshake timed out")?
                    .context("TLS handshake failed")?;
                serve_http1(TokioIo::new(tls_stream), addr, handler, Scheme::Https).await
            }
            None => serve_http1(TokioIo::new(stream), addr, handler, Scheme::Http).await,
        }
    }
}

async fn serve_http1<I>(
    io: I,
    addr: SocketAddr,
    handler: Arc<RequestHandler>,
    scheme: Scheme,
) -> Result<()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { handler.handle_request(req, addr, scheme).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .max_buf_size(MAX_HEADER_BYTES)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .with_context(|| format!("{} connection error", scheme.as_str()))
}

/// Resolves on SIGTERM, SIGINT or SIGQUIT.
pub async fn wait_for_signal() {
    use futures::stream::StreamExt;

    let mut signals = match Signals::new([SIGTERM, SIGINT, SIGQUIT]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(target: ERRORS, "Failed to register signal handlers: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(target: ERRORS, "Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    if let Some(signal) = signals.next().await {
        info!("Received signal {}, shutting down", signal);
    }
}
