use anyhow::Result;
use clap::ValueEnum;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Backend failures, watcher failures and other system errors.
pub const ERRORS: &str = "tlsgate::errors";
/// Config and certificate reload notifications.
pub const REFRESH: &str = "tlsgate::refresh";
/// One event per proxied request.
pub const TRAFFIC: &str = "tlsgate::traffic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let default_filter = if verbose { "tlsgate=debug" } else { "tlsgate=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

/// How a response was produced, recorded on every traffic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Proxied,
    CacheHit,
    NotModified,
    Redirected,
    Tunnel,
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Proxied => "proxied",
            Outcome::CacheHit => "cache_hit",
            Outcome::NotModified => "not_modified",
            Outcome::Redirected => "redirected",
            Outcome::Tunnel => "tunnel",
            Outcome::Rejected => "rejected",
        }
    }
}

#[derive(Debug)]
pub struct LogEntry {
    pub request_id: Uuid,
    pub remote_addr: SocketAddr,
    pub scheme: &'static str,
    pub method: String,
    pub host: String,
    pub uri: String,
    pub status: u16,
    pub response_size: Option<u64>,
    pub duration_ms: f64,
    pub user_agent: Option<String>,
    pub outcome: Outcome,
}

impl LogEntry {
    pub fn emit(&self) {
        tracing::info!(
            target: TRAFFIC,
            request_id = %self.request_id,
            remote_addr = %self.remote_addr.ip(),
            scheme = self.scheme,
            method = %self.method,
            host = %self.host,
            uri = %self.uri,
            status = self.status,
            response_size = self.response_size,
            duration_ms = self.duration_ms,
            user_agent = self.user_agent.as_deref().unwrap_or("-"),
            outcome = self.outcome.as_str(),
            "Request completed"
        );
    }
}
