use crate::error::{BoxError, ProxyError};
use crate::logging::{LogEntry, Outcome, ERRORS, TRAFFIC};
use crate::metrics::MetricsCollector;
use crate::proxy::websocket::{self, is_websocket_upgrade};
use crate::proxy::{Inbound, ProxyHandler};
use crate::routing::{strip_port, Router};
use crate::security::RateLimiterRegistry;
use crate::server::response::{ErrorResponse, ProxyBody};
use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{self, HeaderMap};
use hyper::{Method, Request, Response, Uri};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

/// Which listener a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The per-request pipeline shared by both listeners.
pub struct RequestHandler {
    router: Router,
    rate_limiter: RateLimiterRegistry,
    proxy: ProxyHandler,
    metrics: Arc<MetricsCollector>,
    https_port: u16,
}

impl RequestHandler {
    pub fn new(
        router: Router,
        proxy: ProxyHandler,
        rate_limiter: RateLimiterRegistry,
        https_port: u16,
    ) -> Self {
        Self {
            metrics: proxy.metrics().clone(),
            router,
            rate_limiter,
            proxy,
            https_port,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn proxy(&self) -> &ProxyHandler {
        &self.proxy
    }

    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let request_id = Uuid::new_v4();
        let start_time = Instant::now();

        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let host = request_host(&req);
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let (response, outcome) = self
            .process_request(req, client_addr, scheme, &host)
            .await;

        let duration = start_time.elapsed();
        self.metrics.record_request(response.status(), duration);

        LogEntry {
            request_id,
            remote_addr: client_addr,
            scheme: scheme.as_str(),
            method,
            host,
            uri,
            status: response.status().as_u16(),
            response_size: response.body().size_hint().exact(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            user_agent,
            outcome,
        }
        .emit();

        Ok(response)
    }

    /// route -> redirect -> rate limit -> tunnel | cache | proxy
    async fn process_request<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
        scheme: Scheme,
        host: &str,
    ) -> (Response<ProxyBody>, Outcome)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let route = match self.router.resolve(host).await {
            Ok(route) => route,
            Err(err) => {
                if let ProxyError::RouteNotFound(_) = err {
                    debug!(target: TRAFFIC, host, error = %err, "No route for host");
                } else {
                    self.metrics.record_backend_error();
                    error!(target: ERRORS, host, error = %err, "Unusable route for host");
                }
                return (ErrorResponse::for_error(&err).build(), Outcome::Rejected);
            }
        };

        if scheme == Scheme::Http && route.target_is_https() && !route.skip_redirect {
            self.metrics.record_redirect();
            let location = self.redirect_location(host, req.uri());
            return (
                ErrorResponse::redirect(&location).build(),
                Outcome::Redirected,
            );
        }

        if !self.rate_limiter.allow(client_addr.ip()) {
            self.metrics.record_rate_limited();
            let err = ProxyError::RateLimited(client_addr.ip());
            return (ErrorResponse::for_error(&err).build(), Outcome::Rejected);
        }

        if is_websocket_upgrade(&req) {
            let connector = self.proxy.transports().connector(route.skip_verify);
            return match websocket::tunnel(req, &route, connector, self.metrics.clone()).await {
                Ok(response) => (response, Outcome::Tunnel),
                Err(err) => {
                    self.metrics.record_backend_error();
                    error!(
                        target: ERRORS,
                        host,
                        backend = %route.target,
                        error = %err,
                        "WebSocket tunnel failed"
                    );
                    (ErrorResponse::bad_gateway().build(), Outcome::Tunnel)
                }
            };
        }

        let inbound = Inbound {
            client_ip: client_addr.ip(),
            scheme: scheme.as_str(),
            host: host.to_string(),
        };

        if req.method() == Method::GET {
            if let Some(entry) = self.proxy.cache().get(&inbound.cache_key(req.uri())) {
                self.metrics.record_cache_hit();
                let if_none_match = header_value(req.headers(), header::IF_NONE_MATCH);
                let accept_encoding = header_value(req.headers(), header::ACCEPT_ENCODING);
                return self.proxy.replay(
                    entry,
                    if_none_match,
                    accept_encoding.unwrap_or(""),
                );
            }
            self.metrics.record_cache_miss();
        }

        (
            self.proxy.proxy_request(req, &route, &inbound).await,
            Outcome::Proxied,
        )
    }

    /// `https://host[:port]/path?query`, with the port only when it is not 443.
    pub fn redirect_location(&self, host: &str, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let host = strip_port(host);
        if self.https_port == 443 {
            format!("https://{}{}", host, path_and_query)
        } else {
            format!("https://{}:{}{}", host, self.https_port, path_and_query)
        }
    }
}

/// The Host header, or the authority of an absolute-form request target.
fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_string())
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
