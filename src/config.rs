use crate::error::ConfigError;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};


/// Route key used when no exact host entry exists.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub listen_http: String,
    pub listen_https: String,
    pub cert_dir: String,
    pub cert_file: String,
    pub key_file: String,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub trust_target: BTreeMap<String, bool>,
    #[serde(default)]
    pub no_https_redirect: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub host_header: BTreeMap<String, HostHeaderPolicy>,
}

/// How the outbound Host header is chosen for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostHeaderPolicy {
    /// Keep the client-visible Host.
    Preserve,
    /// Use the target's own host:port.
    Rewrite,
    /// Rewrite for IP-literal targets, preserve for named targets.
    #[default]
    Auto,
}

impl fmt::Display for HostHeaderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostHeaderPolicy::Preserve => "preserve",
            HostHeaderPolicy::Rewrite => "rewrite",
            HostHeaderPolicy::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Absolute locations of the TLS certificate and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut routes = BTreeMap::new();
        routes.insert(WILDCARD.to_string(), "http://127.0.0.1:61147".to_string());

        let mut trust_target = BTreeMap::new();
        trust_target.insert(WILDCARD.to_string(), true);

        let mut no_https_redirect = BTreeMap::new();
        no_https_redirect.insert(WILDCARD.to_string(), false);

        Self {
            listen_http: ":80".to_string(),
            listen_https: ":443".to_string(),
            cert_dir: "./certificates".to_string(),
            cert_file: "certificate.pem".to_string(),
            key_file: "key.pem".to_string(),
            routes,
            trust_target,
            no_https_redirect,
            host_header: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, path)
    }

    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        match ConfigFormat::for_path(path) {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| parse_error(e.to_string())),
            ConfigFormat::Yaml => {
                serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = match ConfigFormat::for_path(path) {
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            ConfigFormat::Yaml => {
                serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path`, or writes and returns the default configuration when the
    /// file does not exist yet. The boolean is true when a default was written.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<(Self, bool), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }

        let config = Config::default();
        config.save(path)?;
        Ok((config, true))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_listen_address(&self.listen_http)?;
        parse_listen_address(&self.listen_https)?;

        if !self.routes.contains_key(WILDCARD) {
            return Err(ConfigError::Validation(format!(
                "routes must contain a '{}' entry",
                WILDCARD
            )));
        }

        for (host, target) in &self.routes {
            validate_target(host, target)?;
        }

        for (field, value) in [
            ("cert_dir", &self.cert_dir),
            ("cert_file", &self.cert_file),
            ("key_file", &self.key_file),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{} must not be empty", field)));
            }
        }

        Ok(())
    }

    pub fn http_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen_address(&self.listen_http)
    }

    pub fn https_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen_address(&self.listen_https)
    }

    pub fn certificate_paths(&self, base_dir: &Path) -> CertificatePaths {
        let dir = base_dir.join(&self.cert_dir);
        CertificatePaths {
            cert: dir.join(&self.cert_file),
            key: dir.join(&self.key_file),
        }
    }
}

/// Accepts `host:port` as well as the `:port` shorthand for all interfaces.
pub fn parse_listen_address(addr: &str) -> Result<SocketAddr, ConfigError> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else if let Some(port) = addr.strip_prefix("localhost:") {
        format!("127.0.0.1:{}", port)
    } else {
        addr.to_string()
    };

    normalized
        .parse()
        .map_err(|_| ConfigError::Validation(format!("invalid listen address: {}", addr)))
}

fn validate_target(host: &str, target: &str) -> Result<(), ConfigError> {
    let uri: Uri = target.parse().map_err(|e| {
        ConfigError::Validation(format!("route '{}' has invalid target '{}': {}", host, target, e))
    })?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(ConfigError::Validation(format!(
                "route '{}' target '{}' must use http or https",
                host, target
            )))
        }
    }

    if uri.host().map_or(true, str::is_empty) {
        return Err(ConfigError::Validation(format!(
            "route '{}' target '{}' has no host",
            host, target
        )));
    }

    Ok(())
}
