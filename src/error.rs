use hyper::StatusCode;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("unusable private key in {path}: {source}")]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("certificate {path} does not pair with its private key: {source}")]
    KeyMismatch {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for CertificateError {
    fn from(err: rcgen::Error) -> Self {
        CertificateError::Generate(err.to_string())
    }
}

/// Failures talking to a route target. Every variant surfaces as 502.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("TLS handshake with {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {addr} timed out")]
    HandshakeTimeout { addr: String },

    #[error("no response headers from backend within {0:?}")]
    ResponseTimeout(Duration),

    #[error("backend request failed: {0}")]
    Request(#[source] hyper_util::client::legacy::Error),

    #[error("failed to read backend response body: {0}")]
    Body(#[source] hyper::Error),

    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// True when the failure came from the client going away mid-request
    /// rather than from the backend.
    pub fn is_client_cancellation(&self) -> bool {
        let BackendError::Request(err) = self else {
            return false;
        };

        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
                if hyper_err.is_canceled() || hyper_err.is_body_write_aborted() {
                    return true;
                }
            }
            source = cause.source();
        }
        false
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("host not configured: {0}")]
    RouteNotFound(String),

    #[error("rate limit exceeded for {0}")]
    RateLimited(IpAddr),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Backend(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            ProxyError::RouteNotFound("a.example".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::RateLimited(IpAddr::V4(Ipv4Addr::LOCALHOST)).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        let backend = BackendError::ResponseTimeout(Duration::from_secs(60));
        assert_eq!(
            ProxyError::from(backend).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_non_request_errors_are_not_cancellations() {
        let err = BackendError::HandshakeTimeout {
            addr: "10.0.0.1:443".into(),
        };
        assert!(!err.is_client_cancellation());
    }
}
