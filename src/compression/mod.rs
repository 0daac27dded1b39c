use bytes::Bytes;
use flate2::{write::GzEncoder, Compression as GzCompression};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, StatusCode};
use std::io::Write;

pub struct CompressionHandler {
    level: GzCompression,
}

impl CompressionHandler {
    pub fn new(level: u32) -> Self {
        Self {
            level: GzCompression::new(level),
        }
    }

    pub fn accepts_gzip(accept_encoding: &str) -> bool {
        accept_encoding.split(',').any(|coding| {
            let mut parts = coding.split(';');
            let name = parts.next().unwrap_or("").trim();
            let rejected = parts.any(|p| {
                p.trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .map_or(false, |q| q == 0.0)
            });
            (name.eq_ignore_ascii_case("gzip") || name == "*") && !rejected
        })
    }

    /// Whether a response with these properties gets gzipped for this client.
    pub fn should_compress(
        &self,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
        accept_encoding: &str,
    ) -> bool {
        if method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return false;
        }

        if headers
            .get(header::CONTENT_ENCODING)
            .map_or(false, |v| !v.is_empty())
        {
            return false;
        }

        let streaming = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("text/event-stream"));

        !streaming && Self::accepts_gzip(accept_encoding)
    }

    pub fn compress_gzip(&self, data: &[u8]) -> std::io::Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        Ok(Bytes::from(compressed))
    }

    /// Gzips `body` and fixes up the headers. Empty bodies are left alone.
    pub fn apply(&self, headers: &mut HeaderMap, body: Bytes) -> std::io::Result<Bytes> {
        if body.is_empty() {
            return Ok(body);
        }

        let compressed = self.compress_gzip(&body)?;
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.remove(header::CONTENT_LENGTH);
        headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        Ok(compressed)
    }
}

impl Default for CompressionHandler {
    fn default() -> Self {
        Self::new(6)
    }
}
