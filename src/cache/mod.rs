//! In-memory response cache keyed by full request URL.
//!
//! Entries are never evicted proactively; an expired entry is ignored on
//! lookup and overwritten by the next successful fetch. Two concurrent misses
//! on the same key may both reach the backend.

use bytes::Bytes;
use dashmap::DashMap;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub etag: String,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedResponse {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) < self.ttl
    }

    /// Whether an `If-None-Match` value names this entry's ETag.
    pub fn matches_etag(&self, if_none_match: &str) -> bool {
        if_none_match
            .split(',')
            .map(str::trim)
            .any(|tag| tag == "*" || tag == self.etag)
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key` if it is still within its TTL.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let entry = self.entries.get(key)?;
        entry.is_fresh(Instant::now()).then(|| entry.value().clone())
    }

    pub fn insert(&self, key: String, response: CachedResponse) {
        self.entries.insert(key, response);
    }

    /// Stores a backend response, returning the ETag it was stored under.
    pub fn store(
        &self,
        key: String,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
    ) -> String {
        let etag = etag_for(headers, &body);
        let ttl = ttl_for(headers);

        let mut stored_headers = headers.clone();
        stored_headers.remove(header::CONTENT_LENGTH);
        stored_headers.remove(header::TRANSFER_ENCODING);
        if let Ok(value) = HeaderValue::from_str(&etag) {
            stored_headers.insert(header::ETAG, value);
        }

        self.insert(
            key,
            CachedResponse {
                status,
                headers: stored_headers,
                body,
                etag: etag.clone(),
                cached_at: Instant::now(),
                ttl,
            },
        );
        etag
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }
}

/// Cache key: `scheme://host/path?query`.
pub fn cache_key(scheme: &str, host: &str, path_and_query: &str) -> String {
    format!("{}://{}{}", scheme, host, path_and_query)
}

/// GET, 200, a textual/image/script/JSON body, and nothing that marks the
/// response as private to one client.
pub fn is_cacheable(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    if method != Method::GET || status != StatusCode::OK {
        return false;
    }

    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }

    let cache_control = header_str(headers, header::CACHE_CONTROL).to_ascii_lowercase();
    if cache_control
        .split(',')
        .map(str::trim)
        .any(|directive| directive == "no-store" || directive == "private")
    {
        return false;
    }

    let Ok(content_type) = header_str(headers, header::CONTENT_TYPE).parse::<mime::Mime>() else {
        return false;
    };

    match (content_type.type_(), content_type.subtype().as_str()) {
        (mime::TEXT, _) | (mime::IMAGE, _) => true,
        (mime::APPLICATION, "javascript") | (mime::APPLICATION, "json") => true,
        _ => false,
    }
}

/// The backend's ETag if present, otherwise a quoted SHA-256 of the body.
pub fn etag_for(headers: &HeaderMap, body: &[u8]) -> String {
    match headers.get(header::ETAG).and_then(|v| v.to_str().ok()) {
        Some(etag) if !etag.is_empty() => etag.to_string(),
        _ => format!("\"{:x}\"", Sha256::digest(body)),
    }
}

/// TTL from `Cache-Control: max-age`, or [`DEFAULT_TTL`] when absent.
pub fn ttl_for(headers: &HeaderMap) -> Duration {
    header_str(headers, header::CACHE_CONTROL)
        .split(',')
        .filter_map(|directive| {
            let (name, value) = directive.trim().split_once('=')?;
            if name.trim().eq_ignore_ascii_case("max-age") {
                value.trim().trim_matches('"').parse::<u64>().ok()
            } else {
                None
            }
        })
        .next()
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TTL)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}
