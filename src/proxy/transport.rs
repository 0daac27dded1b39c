//! Outbound connections to route targets.
//!
//! Two pooled clients share one connector implementation: one verifies the
//! backend's certificate against the webpki roots, the other accepts any
//! certificate for routes whose trust policy says so. The WebSocket tunnel
//! dials through the same connector to get identical timeouts and trust.

use crate::error::BackendError;
use crate::server::response::ProxyBody;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub type BackendClient = Client<BackendConnector, ProxyBody>;

#[derive(Debug, Clone, Copy)]
pub struct TransportTimeouts {
    pub connect: Duration,
    pub tls_handshake: Duration,
    pub response_header: Duration,
    pub idle: Duration,
    pub max_idle_per_host: usize,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            tls_handshake: Duration::from_secs(10),
            response_header: Duration::from_secs(60),
            idle: Duration::from_secs(90),
            max_idle_per_host: 10,
        }
    }
}

/// Accepts every server certificate. Used only for routes marked as trusted.
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub fn verifying_tls_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Client config that accepts any server certificate.
pub fn insecure_tls_config() -> ClientConfig {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// A plain or TLS connection to a backend.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// hyper-facing wrapper so the pooled client can use [`BackendStream`].
pub struct PooledStream(TokioIo<BackendStream>);

impl Read for PooledStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl Write for PooledStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl Connection for PooledStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Dials `http(s)://` and `ws(s)://` targets with per-phase timeouts.
#[derive(Clone)]
pub struct BackendConnector {
    tls: TlsConnector,
    timeouts: TransportTimeouts,
}

impl BackendConnector {
    pub fn new(tls_config: ClientConfig, timeouts: TransportTimeouts) -> Self {
        Self {
            tls: TlsConnector::from(Arc::new(tls_config)),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &TransportTimeouts {
        &self.timeouts
    }

    pub async fn dial(&self, uri: &Uri) -> Result<BackendStream, BackendError> {
        let invalid = |reason: &str| BackendError::InvalidTarget {
            target: uri.to_string(),
            reason: reason.to_string(),
        };

        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let secure = match uri.scheme_str() {
            Some("https") | Some("wss") => true,
            Some("http") | Some("ws") => false,
            _ => return Err(invalid("unsupported scheme")),
        };
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let addr = format!("{}:{}", host, port);

        let tcp = timeout(
            self.timeouts.connect,
            TcpStream::connect((bare_host, port)),
        )
        .await
        .map_err(|_| BackendError::ConnectTimeout {
            addr: addr.clone(),
            timeout: self.timeouts.connect,
        })?
        .map_err(|source| BackendError::Connect {
            addr: addr.clone(),
            source,
        })?;
        let _ = tcp.set_nodelay(true);

        if !secure {
            return Ok(BackendStream::Plain(tcp));
        }

        let server_name = ServerName::try_from(bare_host.to_string())
            .map_err(|_| invalid("host is not a valid TLS server name"))?;

        let tls = timeout(
            self.timeouts.tls_handshake,
            self.tls.connect(server_name, tcp),
        )
        .await
        .map_err(|_| BackendError::HandshakeTimeout { addr: addr.clone() })?
        .map_err(|source| BackendError::TlsHandshake { addr, source })?;

        Ok(BackendStream::Tls(Box::new(tls)))
    }
}

impl tower::Service<Uri> for BackendConnector {
    type Response = PooledStream;
    type Error = BackendError;
    type Future = Pin<Box<dyn Future<Output = Result<PooledStream, BackendError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let stream = connector.dial(&uri).await?;
            Ok(PooledStream(TokioIo::new(stream)))
        })
    }
}

/// The verifying and the insecure transport, each with its own pool.
pub struct Transports {
    verifying: BackendClient,
    insecure: BackendClient,
    verifying_connector: BackendConnector,
    insecure_connector: BackendConnector,
    timeouts: TransportTimeouts,
}

impl Transports {
    pub fn new(timeouts: TransportTimeouts) -> Self {
        let verifying_connector = BackendConnector::new(verifying_tls_config(), timeouts);
        let insecure_connector = BackendConnector::new(insecure_tls_config(), timeouts);

        Self {
            verifying: build_client(verifying_connector.clone(), timeouts),
            insecure: build_client(insecure_connector.clone(), timeouts),
            verifying_connector,
            insecure_connector,
            timeouts,
        }
    }

    pub fn client(&self, skip_verify: bool) -> &BackendClient {
        if skip_verify {
            &self.insecure
        } else {
            &self.verifying
        }
    }

    pub fn connector(&self, skip_verify: bool) -> &BackendConnector {
        if skip_verify {
            &self.insecure_connector
        } else {
            &self.verifying_connector
        }
    }

    pub fn timeouts(&self) -> &TransportTimeouts {
        &self.timeouts
    }

    /// Sends `req` and waits at most the response-header timeout for the head.
    pub async fn send(
        &self,
        req: hyper::Request<ProxyBody>,
        skip_verify: bool,
    ) -> Result<hyper::Response<hyper::body::Incoming>, BackendError> {
        timeout(self.timeouts.response_header, self.client(skip_verify).request(req))
            .await
            .map_err(|_| BackendError::ResponseTimeout(self.timeouts.response_header))?
            .map_err(BackendError::Request)
    }
}

impl Default for Transports {
    fn default() -> Self {
        Self::new(TransportTimeouts::default())
    }
}

fn build_client(connector: BackendConnector, timeouts: TransportTimeouts) -> BackendClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(timeouts.idle)
        .pool_max_idle_per_host(timeouts.max_idle_per_host)
        .pool_timer(TokioTimer::new())
        .build(connector)
}
