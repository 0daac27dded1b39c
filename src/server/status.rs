//! Small plaintext status service. It doubles as the default wildcard
//! target, so a fresh install answers something useful on every host.

use crate::logging::ERRORS;
use crate::metrics::prometheus::PrometheusExporter;
use crate::metrics::MetricsCollector;
use crate::server::response::{ErrorResponse, ProxyBody, ResponseBuilder};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const INDEX_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>tlsgate</title></head>\n<body>\n<h1>tlsgate is up</h1>\n<p>No route is configured for this host yet.</p>\n</body>\n</html>\n";

pub struct StatusServer {
    exporter: PrometheusExporter,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StatusServer {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            exporter: PrometheusExporter::new(metrics),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn respond(&self, path: &str) -> Response<ProxyBody> {
        match path {
            "/" => ResponseBuilder::new(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .body(INDEX_PAGE)
                .build(),
            "/metrics" => ResponseBuilder::new(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(self.exporter.render())
                .build(),
            "/health" => {
                let health = serde_json::json!({
                    "status": "ok",
                    "version": env!("CARGO_PKG_VERSION"),
                    "started_at": self.started_at.to_rfc3339(),
                    "uptime_seconds": self.started.elapsed().as_secs(),
                });
                ResponseBuilder::new(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(health.to_string())
                    .build()
            }
            _ => ErrorResponse::not_found().build(),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status page to {}", addr))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Status page listening on http://{}", addr);
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(target: ERRORS, "Status page failed to accept connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let response = server.respond(req.uri().path());
                    async move { Ok::<_, Infallible>(response) }
                });

                if let Err(e) = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Status connection from {} failed: {}", addr, e);
                }
            });
        }
    }
}
