use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tlsgate::cache::ResponseCache;
use tlsgate::compression::CompressionHandler;
use tlsgate::config::Config;
use tlsgate::config_reload::ConfigManager;
use tlsgate::metrics::MetricsCollector;
use tlsgate::proxy::transport::insecure_tls_config;
use tlsgate::proxy::{ProxyHandler, Transports};
use tlsgate::routing::Router;
use tlsgate::security::RateLimiterRegistry;
use tlsgate::server::{CertificateStore, HttpServer, RequestHandler};
use tlsgate::ssl_cert_gen::CertificateGenerator;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;

struct Gateway {
    http: SocketAddr,
    https: SocketAddr,
    certificates: Arc<CertificateStore>,
    manager: Arc<ConfigManager>,
    dir: TempDir,
    _shutdown: oneshot::Sender<()>,
}

async fn start_gateway(routes: &[(&str, &str)]) -> Gateway {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.routes = routes
        .iter()
        .map(|(host, target)| (host.to_string(), target.to_string()))
        .collect();

    let paths = config.certificate_paths(dir.path());
    CertificateGenerator::ensure_certificates_exist(&paths, &[])
        .await
        .unwrap();
    let certificates = Arc::new(CertificateStore::load_from(paths).await.unwrap());
    let manager = Arc::new(ConfigManager::new(
        config,
        dir.path().join("config.yaml"),
        dir.path(),
        certificates.clone(),
    ));

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let https_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = http_listener.local_addr().unwrap();
    let https = https_listener.local_addr().unwrap();

    let metrics = Arc::new(MetricsCollector::new());
    let proxy = ProxyHandler::new(
        Transports::default(),
        Arc::new(ResponseCache::new()),
        CompressionHandler::default(),
        metrics,
    );
    let handler = Arc::new(RequestHandler::new(
        Router::new(manager.get_config()),
        proxy,
        RateLimiterRegistry::default(),
        https.port(),
    ));

    let (tx, rx) = oneshot::channel::<()>();
    let server = HttpServer::new(handler, certificates.clone());
    tokio::spawn(server.serve(http_listener, https_listener, async move {
        let _ = rx.await;
    }));

    Gateway {
        http,
        https,
        certificates,
        manager,
        dir,
        _shutdown: tx,
    }
}

/// Backend that answers every request with `name`, echoing the forwarding headers.
async fn spawn_backend(name: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut builder = Response::builder().header(header::CONTENT_TYPE, "text/plain");
                    for name in ["x-forwarded-proto", "x-forwarded-host", "x-forwarded-for"] {
                        if let Some(value) = req.headers().get(name) {
                            builder = builder.header(format!("echo-{}", name), value.clone());
                        }
                    }
                    async move {
                        Ok::<_, Infallible>(builder.body(Full::new(Bytes::from_static(name.as_bytes()))).unwrap())
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

/// Accepts one upgrade, answers 101 and echoes every byte back.
async fn spawn_echo_websocket() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(String::from_utf8_lossy(&head).starts_with("GET /socket HTTP/1.1\r\n"));

        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();

        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    addr
}

async fn http_get(addr: SocketAddr, host: &str, path: &str) -> (StatusCode, HeaderMap, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header(header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

/// GET over TLS, also returning the DER of the certificate the server presented.
async fn https_get(
    addr: SocketAddr,
    host: &str,
    path: &str,
) -> (StatusCode, HeaderMap, Bytes, Vec<u8>) {
    let connector = TlsConnector::from(Arc::new(insecure_tls_config()));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    let leaf = tls.get_ref().1.peer_certificates().unwrap()[0]
        .as_ref()
        .to_vec();

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(path)
        .header(header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body, leaf)
}

#[test]
fn test_default_config_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");

    let (created, was_created) = Config::load_or_create(&path).unwrap();
    assert!(was_created);
    let (loaded, was_created) = Config::load_or_create(&path).unwrap();
    assert!(!was_created);
    assert_eq!(created, loaded);
    assert_eq!(loaded, Config::default());
}

#[tokio::test]
async fn test_proxies_over_https() {
    let (backend, hits) = spawn_backend("backend-a").await;
    let target = format!("http://{}", backend);
    let gateway = start_gateway(&[("*", target.as_str())]).await;

    let (status, headers, body, _) = https_get(gateway.https, "app.example.com", "/hello").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"backend-a"));
    assert_eq!(headers["echo-x-forwarded-proto"], "https");
    assert_eq!(headers["echo-x-forwarded-host"], "app.example.com");
    assert_eq!(headers["echo-x-forwarded-for"], "127.0.0.1");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exact_host_wins_over_wildcard() {
    let (fallback, _) = spawn_backend("fallback").await;
    let (api, _) = spawn_backend("api").await;
    let fallback = format!("http://{}", fallback);
    let api = format!("http://{}", api);
    let gateway = start_gateway(&[("*", fallback.as_str()), ("api.example.com", api.as_str())]).await;

    let (_, _, body) = http_get(gateway.http, "api.example.com", "/a").await;
    assert_eq!(body, Bytes::from_static(b"api"));

    let (_, _, body) = http_get(gateway.http, "api.example.com:8080", "/b").await;
    assert_eq!(body, Bytes::from_static(b"api"));

    let (_, _, body) = http_get(gateway.http, "www.example.com", "/c").await;
    assert_eq!(body, Bytes::from_static(b"fallback"));
}

#[tokio::test]
async fn test_plaintext_request_redirects_to_https() {
    let gateway = start_gateway(&[("*", "https://127.0.0.1:9")]).await;

    let (status, headers, _) = http_get(gateway.http, "app.example.com", "/path?q=1").await;

    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        headers[header::LOCATION],
        format!("https://app.example.com:{}/path?q=1", gateway.https.port()).as_str()
    );
}

#[tokio::test]
async fn test_repeated_get_hits_backend_once() {
    let (backend, hits) = spawn_backend("cached").await;
    let target = format!("http://{}", backend);
    let gateway = start_gateway(&[("*", target.as_str())]).await;

    let (_, first_headers, first) = http_get(gateway.http, "app.example.com", "/doc").await;
    let (_, _, second) = http_get(gateway.http, "app.example.com", "/doc").await;

    assert_eq!(first, second);
    assert!(first_headers.contains_key(header::ETAG));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);
    let gateway = start_gateway(&[("*", target.as_str())]).await;

    let (status, _, body) = http_get(gateway.http, "app.example.com", "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, Bytes::from_static(b"Proxy error\n"));
}

#[tokio::test]
async fn test_websocket_tunnel_relays_bytes() {
    let backend = spawn_echo_websocket().await;
    let target = format!("http://{}", backend);
    let gateway = start_gateway(&[("*", target.as_str())]).await;

    let mut client = TcpStream::connect(gateway.http).await.unwrap();
    client
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: chat.example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 101"));

    client.write_all(b"first frame").await.unwrap();
    let mut echoed = [0u8; 11];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"first frame");

    client.write_all(b"second").await.unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"second");
}

#[tokio::test]
async fn test_certificate_hot_reload() {
    let (backend, _) = spawn_backend("tls").await;
    let target = format!("http://{}", backend);
    let gateway = start_gateway(&[("*", target.as_str())]).await;

    let (_, _, _, before) = https_get(gateway.https, "app.example.com", "/").await;

    // Let the mtime move past the initial load.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let generated =
        CertificateGenerator::generate_self_signed_cert(&["rotated.example.com".to_string()])
            .unwrap();
    let paths = gateway.certificates.paths();
    std::fs::write(&paths.cert, generated.cert_pem.as_bytes()).unwrap();
    std::fs::write(&paths.key, generated.key_pem.as_bytes()).unwrap();

    assert!(gateway.certificates.reload_if_changed().await);

    let (status, _, _, after) = https_get(gateway.https, "app.example.com", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(before, after);
}

#[tokio::test]
async fn test_config_reload_reroutes_traffic() {
    let (old_backend, _) = spawn_backend("old").await;
    let (new_backend, _) = spawn_backend("new").await;
    let old_target = format!("http://{}", old_backend);
    let gateway = start_gateway(&[("*", old_target.as_str())]).await;

    let (_, _, body) = http_get(gateway.http, "app.example.com", "/x").await;
    assert_eq!(body, Bytes::from_static(b"old"));

    let mut updated = gateway.manager.snapshot().await;
    updated
        .routes
        .insert("app.example.com".to_string(), format!("http://{}", new_backend));
    updated.save(gateway.dir.path().join("config.yaml")).unwrap();
    let changes = gateway.manager.reload_from_disk().await.unwrap();
    assert_eq!(changes.len(), 1);

    let (_, _, body) = http_get(gateway.http, "app.example.com", "/y").await;
    assert_eq!(body, Bytes::from_static(b"new"));
}
