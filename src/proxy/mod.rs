//! The forwarding half of the pipeline: request rewrite, dispatch over the
//! pooled transports, and response post-processing (cache write-back and
//! gzip). Cache replay for hits found by the request handler lives here too
//! so both paths compress the same way.

pub mod transport;
pub mod websocket;

use crate::cache::{self, CachedResponse, ResponseCache};
use crate::compression::CompressionHandler;
use crate::error::{BackendError, BoxError};
use crate::logging::{Outcome, ERRORS};
use crate::metrics::MetricsCollector;
use crate::routing::Route;
use crate::server::response::{full_body, ErrorResponse, ProxyBody, ResponseBuilder};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub use transport::{BackendConnector, TransportTimeouts, Transports};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Connection-level headers that only describe the inbound hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// What the client side of the request looked like.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub client_ip: IpAddr,
    /// `http` or `https`, depending on the listener.
    pub scheme: &'static str,
    /// The Host header as the client sent it.
    pub host: String,
}

impl Inbound {
    pub fn cache_key(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        cache::cache_key(self.scheme, &self.host, path_and_query)
    }
}

pub struct ProxyHandler {
    transports: Transports,
    cache: Arc<ResponseCache>,
    compression: CompressionHandler,
    metrics: Arc<MetricsCollector>,
}

impl ProxyHandler {
    pub fn new(
        transports: Transports,
        cache: Arc<ResponseCache>,
        compression: CompressionHandler,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            transports,
            cache,
            compression,
            metrics,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn transports(&self) -> &Transports {
        &self.transports
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Forwards `req` to the route target. Backend failures become 502.
    pub async fn proxy_request<B>(
        &self,
        req: Request<B>,
        route: &Route,
        inbound: &Inbound,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let accept_encoding = header_string(req.headers(), header::ACCEPT_ENCODING);
        let cache_key = (method == Method::GET).then(|| inbound.cache_key(req.uri()));

        let mut req = req.map(|body| -> ProxyBody { body.map_err(|e| e.into()).boxed_unsync() });
        if let Err(err) = rewrite_request(&mut req, route, inbound) {
            return self.backend_failure(&err, route, inbound);
        }

        let response = match self.transports.send(req, route.skip_verify).await {
            Ok(response) => response,
            Err(err) => return self.backend_failure(&err, route, inbound),
        };

        self.post_process(response, &method, &accept_encoding, cache_key)
            .await
            .unwrap_or_else(|err| self.backend_failure(&err, route, inbound))
    }

    /// Builds the client response for a fresh cache entry: 304 when the
    /// client already holds it, otherwise the stored response, gzipped if
    /// this client accepts it.
    pub fn replay(
        &self,
        entry: CachedResponse,
        if_none_match: Option<&str>,
        accept_encoding: &str,
    ) -> (Response<ProxyBody>, Outcome) {
        if if_none_match.map_or(false, |tags| entry.matches_etag(tags)) {
            return (
                ErrorResponse::not_modified(&entry.etag).build(),
                Outcome::NotModified,
            );
        }

        let mut headers = entry.headers;
        let mut body = entry.body;
        if self
            .compression
            .should_compress(&Method::GET, entry.status, &headers, accept_encoding)
        {
            body = self.compress_or_identity(&mut headers, body);
        }

        (
            ResponseBuilder::new(entry.status)
                .headers(headers)
                .body(body)
                .build(),
            Outcome::CacheHit,
        )
    }

    async fn post_process(
        &self,
        response: Response<Incoming>,
        method: &Method,
        accept_encoding: &str,
        cache_key: Option<String>,
    ) -> Result<Response<ProxyBody>, BackendError> {
        let (mut parts, body) = response.into_parts();

        if parts.status == StatusCode::SWITCHING_PROTOCOLS {
            return Ok(Response::from_parts(parts, stream_body(body)));
        }
        strip_hop_by_hop(&mut parts.headers);

        let compress = self
            .compression
            .should_compress(method, parts.status, &parts.headers, accept_encoding);
        let cache_key =
            cache_key.filter(|_| cache::is_cacheable(method, parts.status, &parts.headers));

        if !compress && cache_key.is_none() {
            return Ok(Response::from_parts(parts, stream_body(body)));
        }

        let mut body = body
            .collect()
            .await
            .map_err(BackendError::Body)?
            .to_bytes();

        if let Some(key) = cache_key {
            let etag = self.cache.store(key, parts.status, &parts.headers, body.clone());
            if let Ok(value) = HeaderValue::from_str(&etag) {
                parts.headers.insert(header::ETAG, value);
            }
        }

        if compress {
            body = self.compress_or_identity(&mut parts.headers, body);
        }

        parts.headers.remove(header::TRANSFER_ENCODING);
        parts.headers.remove(header::CONTENT_LENGTH);
        Ok(Response::from_parts(parts, full_body(body)))
    }

    fn compress_or_identity(&self, headers: &mut HeaderMap, body: Bytes) -> Bytes {
        match self.compression.apply(headers, body.clone()) {
            Ok(compressed) => compressed,
            Err(err) => {
                warn!(target: ERRORS, error = %err, "Gzip failed, sending identity body");
                body
            }
        }
    }

    fn backend_failure(
        &self,
        err: &BackendError,
        route: &Route,
        inbound: &Inbound,
    ) -> Response<ProxyBody> {
        if err.is_client_cancellation() {
            debug!(host = %inbound.host, "Client went away during proxying");
        } else {
            self.metrics.record_backend_error();
            error!(
                target: ERRORS,
                host = %inbound.host,
                backend = %route.target,
                error = %err,
                "Backend request failed"
            );
        }
        ErrorResponse::bad_gateway().build()
    }
}

fn stream_body(body: Incoming) -> ProxyBody {
    body.map_err(BoxError::from).boxed_unsync()
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Removes the fixed hop-by-hop set plus any header named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Joins the target's base path and the request path with exactly one `/`.
pub fn single_joining_slash(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Points `req` at the route target and sets the forwarding headers.
pub fn rewrite_request<B>(
    req: &mut Request<B>,
    route: &Route,
    inbound: &Inbound,
) -> Result<(), BackendError> {
    let invalid = |reason: String| BackendError::InvalidTarget {
        target: route.target.to_string(),
        reason,
    };

    let authority = route
        .target
        .authority()
        .ok_or_else(|| invalid("target has no host".to_string()))?
        .clone();
    let scheme = route.target.scheme_str().unwrap_or("http");

    let mut path = single_joining_slash(route.target.path(), req.uri().path());
    if let Some(query) = req.uri().query() {
        path.push('?');
        path.push_str(query);
    }

    *req.uri_mut() = Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(path)
        .build()
        .map_err(|e| invalid(e.to_string()))?;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);

    let host = if route.rewrites_host() {
        authority.as_str()
    } else {
        inbound.host.as_str()
    };
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(header::HOST, value);
    }

    let client_ip = inbound.client_ip.to_string();
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&inbound.host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(inbound.scheme));

    Ok(())
}
