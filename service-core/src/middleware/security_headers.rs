use axum::{
    extract::Request,
    http::{header, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

const COMMON: &[(HeaderName, &str)] = &[
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (
        header::STRICT_TRANSPORT_SECURITY,
        "max-age=31536000; includeSubDomains",
    ),
    (header::REFERRER_POLICY, "no-referrer"),
];

/// Every non-docs response may carry credentials, so none of it is cacheable
/// or frameable.
const API: &[(HeaderName, &str)] = &[
    (header::CACHE_CONTROL, "no-store"),
    (header::PRAGMA, "no-cache"),
    (
        header::CONTENT_SECURITY_POLICY,
        "default-src 'none'; frame-ancestors 'none'",
    ),
    (header::X_FRAME_OPTIONS, "DENY"),
];

const DOCS: &[(HeaderName, &str)] = &[
    (
        header::CONTENT_SECURITY_POLICY,
        "default-src 'self'; script-src 'self' 'unsafe-inline'; \
         style-src 'self' 'unsafe-inline'; img-src 'self' data:",
    ),
    (header::X_FRAME_OPTIONS, "SAMEORIGIN"),
];

fn is_docs_path(path: &str) -> bool {
    path == "/docs" || path.starts_with("/docs/") || path == "/.well-known/openapi.json"
}

pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let policy = if is_docs_path(req.uri().path()) {
        DOCS
    } else {
        API
    };

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for (name, value) in COMMON.iter().chain(policy) {
        headers.insert(name.clone(), HeaderValue::from_static(*value));
    }
    response
}
