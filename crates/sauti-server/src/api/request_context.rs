//! Correlation ids for request and transport tracing.
//!
//! Every HTTP request and WebSocket upgrade carries a correlation id,
//! either taken from the caller's `x-request-id` header or generated in
//! the same prefixed shape as session and turn ids. The id is echoed on
//! the response and threaded into the transport's attach/detach logs so
//! one conversation can be followed across handlers and sockets.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub correlation_id: String,
}

pub async fn attach_request_context(mut req: Request, next: Next) -> Response {
    let correlation_id = resolve_correlation_id(req.headers());
    req.extensions_mut().insert(RequestContext {
        correlation_id: correlation_id.clone(),
    });

    let mut response = next.run(req).await;
    if let Ok(value) = correlation_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// The caller's id when present, otherwise a fresh `req_` id.
fn resolve_correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn caller_header_wins_and_is_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("  abc-123  "));
        assert_eq!(resolve_correlation_id(&headers), "abc-123");
    }

    #[test]
    fn blank_header_gets_generated_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("   "));
        assert!(resolve_correlation_id(&headers).starts_with("req_"));
    }

    #[test]
    fn missing_header_gets_unique_generated_id() {
        let a = resolve_correlation_id(&HeaderMap::new());
        let b = resolve_correlation_id(&HeaderMap::new());
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }
}
