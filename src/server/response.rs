use crate::error::{BoxError, ProxyError};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{header, HeaderMap, Response, StatusCode};

/// Body type for every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub struct ResponseBuilder {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Invalid header values are dropped rather than failing the response.
    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Response<ProxyBody> {
        let body = if self.body.is_empty() {
            empty_body()
        } else {
            full_body(self.body)
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub struct ErrorResponse;

impl ErrorResponse {
    fn plain(status: StatusCode, message: &'static str) -> ResponseBuilder {
        ResponseBuilder::new(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Bytes::from_static(message.as_bytes()))
    }

    pub fn not_found() -> ResponseBuilder {
        Self::plain(StatusCode::NOT_FOUND, "Host not configured\n")
    }

    pub fn too_many_requests() -> ResponseBuilder {
        Self::plain(StatusCode::TOO_MANY_REQUESTS, "Too many requests\n").header(header::RETRY_AFTER, "1")
    }

    pub fn bad_gateway() -> ResponseBuilder {
        Self::plain(StatusCode::BAD_GATEWAY, "Proxy error\n")
    }

    /// The client-facing answer for a request the pipeline gave up on.
    pub fn for_error(err: &ProxyError) -> ResponseBuilder {
        match err.status_code() {
            StatusCode::NOT_FOUND => Self::not_found(),
            StatusCode::TOO_MANY_REQUESTS => Self::too_many_requests(),
            _ => Self::bad_gateway(),
        }
    }

    pub fn not_modified(etag: &str) -> ResponseBuilder {
        ResponseBuilder::new(StatusCode::NOT_MODIFIED).header(header::ETAG, etag)
    }

    pub fn redirect(location: &str) -> ResponseBuilder {
        ResponseBuilder::new(StatusCode::MOVED_PERMANENTLY).header(header::LOCATION, location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    #[tokio::test]
    async fn test_error_bodies() {
        let response = ErrorResponse::not_found().build();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"Host not configured\n"));

        let response = ErrorResponse::too_many_requests().build();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_error_statuses() {
        let not_found = ErrorResponse::for_error(&ProxyError::RouteNotFound("a.example".into()));
        assert_eq!(not_found.build().status(), StatusCode::NOT_FOUND);

        let limited = ErrorResponse::for_error(&ProxyError::RateLimited(
            std::net::Ipv4Addr::LOCALHOST.into(),
        ));
        assert_eq!(limited.build().status(), StatusCode::TOO_MANY_REQUESTS);

        let invalid = ErrorResponse::for_error(&ProxyError::Backend(BackendError::InvalidTarget {
            target: "http://bad target".into(),
            reason: "invalid uri character".into(),
        }));
        assert_eq!(invalid.build().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_not_modified_has_no_body() {
        let response = ErrorResponse::not_modified("\"abc\"").build();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers().get(header::ETAG).unwrap(), "\"abc\"");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[test]
    fn test_redirect_location() {
        let response = ErrorResponse::redirect("https://a.example.com/x?y=1").build();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://a.example.com/x?y=1"
        );
    }
}
