//! Host based route resolution.
//!
//! `routes`, `trust_target`, `no_https_redirect` and `host_header` are looked
//! up independently, each falling back to its own wildcard entry. A host that
//! has an explicit route but no trust entry still inherits the wildcard's
//! trust value.

use crate::config::{Config, HostHeaderPolicy, WILDCARD};
use crate::error::{BackendError, ProxyError};
use hyper::Uri;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Target and per-host policy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: Uri,
    pub skip_verify: bool,
    pub skip_redirect: bool,
    pub host_header: HostHeaderPolicy,
}

impl Route {
    /// Resolves `host` against a configuration snapshot.
    pub fn resolve(config: &Config, host: &str) -> Result<Route, ProxyError> {
        let target = lookup(&config.routes, host)
            .ok_or_else(|| ProxyError::RouteNotFound(host.to_string()))?;

        let target: Uri = target.parse().map_err(|e: http::uri::InvalidUri| {
            BackendError::InvalidTarget {
                target: target.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Route {
            target,
            skip_verify: lookup(&config.trust_target, host).copied().unwrap_or(false),
            skip_redirect: lookup(&config.no_https_redirect, host)
                .copied()
                .unwrap_or(false),
            host_header: lookup(&config.host_header, host)
                .copied()
                .unwrap_or_default(),
        })
    }

    pub fn target_is_https(&self) -> bool {
        matches!(self.target.scheme_str(), Some("https") | Some("wss"))
    }

    /// True when the target host is an IPv4 or IPv6 literal.
    pub fn target_is_ip_literal(&self) -> bool {
        self.target
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .map_or(false, |h| h.parse::<IpAddr>().is_ok())
    }

    /// Whether the outbound Host header should be the target's own authority.
    pub fn rewrites_host(&self) -> bool {
        match self.host_header {
            HostHeaderPolicy::Preserve => false,
            HostHeaderPolicy::Rewrite => true,
            HostHeaderPolicy::Auto => self.target_is_ip_literal(),
        }
    }
}

/// Exact host, then host without port, then wildcard.
fn lookup<'a, V>(map: &'a BTreeMap<String, V>, host: &str) -> Option<&'a V> {
    map.get(host)
        .or_else(|| {
            let bare = strip_port(host);
            if bare.len() != host.len() {
                map.get(bare)
            } else {
                None
            }
        })
        .or_else(|| map.get(WILDCARD))
}

/// Removes a trailing `:port`, leaving bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Resolves routes against the live configuration held by the config store.
#[derive(Clone)]
pub struct Router {
    config: Arc<RwLock<Config>>,
}

impl Router {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        Self { config }
    }

    pub async fn resolve(&self, host: &str) -> Result<Route, ProxyError> {
        let config = self.config.read().await;
        Route::resolve(&config, host)
    }
}
