//! WebSocket upgrades are not proxied through the pooled client. The
//! request head is written to a freshly dialled backend connection, the
//! backend's answer is relayed, and after a `101` the two sockets are spliced
//! byte for byte with no framing awareness.

use crate::error::BackendError;
use crate::metrics::MetricsCollector;
use crate::proxy::transport::BackendConnector;
use crate::routing::Route;
use crate::server::response::{empty_body, ProxyBody, ResponseBuilder};
use bytes::{Bytes, BytesMut};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Largest backend response head accepted before the tunnel is abandoned.
pub const MAX_RESPONSE_HEAD: usize = 64 * 1024;
/// How long the second direction may keep running after the first closes.
pub const CLOSE_GRACE: Duration = Duration::from_secs(30);
const MAX_HEADERS: usize = 100;
const MAX_REFUSAL_BODY: usize = 1024 * 1024;

pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// The request line and headers exactly as they will be sent to the backend.
pub fn request_head<B>(req: &Request<B>) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();
    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Bytes the backend sent after the head, already read off the socket.
    pub leftover: Bytes,
}

pub async fn read_response_head<S>(stream: &mut S) -> Result<ResponseHead, BackendError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(BackendError::Upgrade(
                "backend closed the connection before responding".to_string(),
            ));
        }

        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut slots);
        let head_len = match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) if buf.len() < MAX_RESPONSE_HEAD => continue,
            Ok(httparse::Status::Partial) => {
                return Err(BackendError::Upgrade(format!(
                    "response head larger than {} bytes",
                    MAX_RESPONSE_HEAD
                )))
            }
            Err(e) => {
                return Err(BackendError::Upgrade(format!(
                    "malformed response head: {}",
                    e
                )))
            }
        };

        let status = parsed
            .code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| BackendError::Upgrade("invalid status code".to_string()))?;

        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|e| BackendError::Upgrade(e.to_string()))?;
            let value =
                HeaderValue::from_bytes(h.value).map_err(|e| BackendError::Upgrade(e.to_string()))?;
            headers.append(name, value);
        }

        let leftover = buf.split_off(head_len).freeze();
        return Ok(ResponseHead {
            status,
            headers,
            leftover,
        });
    }
}

/// Opens a tunnel for an upgrade request. The returned response goes back
/// to the client; on `101` the splice runs in a spawned task once hyper
/// hands over the client connection.
pub async fn tunnel<B>(
    req: Request<B>,
    route: &Route,
    connector: &BackendConnector,
    metrics: Arc<MetricsCollector>,
) -> Result<Response<ProxyBody>, BackendError>
where
    B: Send + 'static,
{
    let wait = connector.timeouts().response_header;
    let mut backend = connector.dial(&route.target).await?;
    let request = request_head(&req);
    backend.write_all(&request).await?;

    let head = timeout(wait, read_response_head(&mut backend))
        .await
        .map_err(|_| BackendError::ResponseTimeout(wait))??;

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %head.status, backend = %route.target, "Backend refused upgrade");
        return timeout(wait, relay_refusal(&mut backend, head))
            .await
            .map_err(|_| BackendError::ResponseTimeout(wait))?;
    }

    let on_upgrade = hyper::upgrade::on(req);
    let leftover = head.leftover;
    let backend_name = route.target.to_string();
    metrics.tunnel_opened();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if leftover.is_empty() || client.write_all(&leftover).await.is_ok() {
                    let (sent, received) = splice(client, backend, CLOSE_GRACE).await;
                    debug!(
                        backend = %backend_name,
                        bytes_sent = sent,
                        bytes_received = received,
                        "Tunnel closed"
                    );
                }
            }
            Err(err) => debug!(error = %err, "Client connection was never upgraded"),
        }
        metrics.tunnel_closed();
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = head.headers;
    Ok(response)
}

/// Relays a non-101 answer with its `Content-Length` body.
async fn relay_refusal<S>(
    backend: &mut S,
    head: ResponseHead,
) -> Result<Response<ProxyBody>, BackendError>
where
    S: AsyncRead + Unpin,
{
    let mut headers = head.headers;
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_REFUSAL_BODY);

    let mut body = BytesMut::from(&head.leftover[..head.leftover.len().min(length)]);
    if body.len() < length {
        let mut rest = vec![0u8; length - body.len()];
        backend.read_exact(&mut rest).await?;
        body.extend_from_slice(&rest);
    }

    for name in [
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::CONNECTION,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }

    Ok(ResponseBuilder::new(head.status)
        .headers(headers)
        .body(body.freeze())
        .build())
}

/// Copies bytes both ways until one direction finishes, then gives the
/// other `grace` to drain. Returns (client to backend, backend to client).
pub async fn splice<C, T>(client: C, backend: T, grace: Duration) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied.unwrap_or_else(|e| {
            debug!(error = %e, "Client side of tunnel ended");
            0
        })
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied.unwrap_or_else(|e| {
            debug!(error = %e, "Backend side of tunnel ended");
            0
        })
    };
    tokio::pin!(upstream, downstream);

    tokio::select! {
        sent = &mut upstream => {
            let received = timeout(grace, &mut downstream).await.unwrap_or(0);
            (sent, received)
        }
        received = &mut downstream => {
            let sent = timeout(grace, &mut upstream).await.unwrap_or(0);
            (sent, received)
        }
    }
}
