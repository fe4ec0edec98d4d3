//! Access logging middleware for the proxy service.
//!
//! Every request is tagged with a `request_id` (taken from `x-request-id` or
//! generated), which is forwarded upstream, echoed back to the client, and
//! bound to every access record. Headers are logged at Debug with
//! credentials redacted.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use tower::{Layer, Service};

use crate::logging::{Attr, Level, Logger};

/// Header carrying the request correlation id.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Headers whose values are never logged.
const SENSITIVE_HEADERS: [&str; 6] = [
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
    "x-api-key",
    "x-auth-token",
];

const MAX_LOGGED_HEADERS: usize = 50;
const MAX_HEADER_VALUE_BYTES: usize = 1024;

/// Display adapter rendering a header map with credentials redacted.
pub struct SanitizedHeaders<'a>(pub &'a HeaderMap);

impl fmt::Display for SanitizedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i == MAX_LOGGED_HEADERS {
                write!(f, ", ...{} more", self.0.len() - MAX_LOGGED_HEADERS)?;
                break;
            }
            if i > 0 {
                f.write_str(", ")?;
            }
            if SENSITIVE_HEADERS.contains(&name.as_str()) {
                write!(f, "{name}: [REDACTED]")?;
                continue;
            }
            let value = String::from_utf8_lossy(value.as_bytes());
            write!(f, "{name}: {}", truncate(&value, MAX_HEADER_VALUE_BYTES))?;
        }
        f.write_str("}")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Read `x-request-id`, or generate and insert one.
pub fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(id) = headers.get(&X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(X_REQUEST_ID.clone(), value);
    }
    id
}

/// [`Layer`] producing [`AccessLog`] services.
#[derive(Clone, Debug)]
pub struct AccessLogLayer {
    logger: Logger,
}

impl AccessLogLayer {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLog {
            inner,
            logger: self.logger.clone(),
        }
    }
}

/// Service wrapper emitting one record per request and per response.
#[derive(Clone, Debug)]
pub struct AccessLog<S> {
    inner: S,
    logger: Logger,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AccessLog<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let request_id = ensure_request_id(req.headers_mut());
        let logger = self.logger.with(&[Attr::new("request_id", &request_id)]);

        logger.info(
            "Request",
            &[
                Attr::new("method", req.method()),
                Attr::new("uri", req.uri().to_string()),
            ],
        );
        if logger.enabled(Level::Debug) {
            logger.debug(
                "Request headers",
                &[Attr::new("headers", SanitizedHeaders(req.headers()).to_string())],
            );
        }

        // Take the service that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let start = Instant::now();

        Box::pin(async move {
            let mut response = inner.call(req).await?;

            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(X_REQUEST_ID.clone(), value);
            }
            logger.info(
                "Response",
                &[
                    Attr::new("status", response.status()),
                    Attr::new("latency_ms", start.elapsed().as_millis() as u64),
                ],
            );
            if logger.enabled(Level::Debug) {
                logger.debug(
                    "Response headers",
                    &[Attr::new(
                        "headers",
                        SanitizedHeaders(response.headers()).to_string(),
                    )],
                );
            }
            Ok(response)
        })
    }
}
