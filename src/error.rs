//! Error types for the SpecGate proxy.
//!
//! The taxonomy follows the fail-open rule: only [`ConfigError`] stops the
//! process, only transport failures change what the client sees, and every
//! other pipeline failure degrades to passing the original response through.

use http::{Response, StatusCode, header};
use serde::Serialize;
use thiserror::Error;

use crate::contract::ContractError;
use crate::guard::GuardError;
use crate::policy::InvalidModeError;
use crate::proxy_body::{self, ProxyBody};
use crate::resolver::ResolveError;

/// Fatal construction-time errors. The proxy is never started.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Mode string is not one of strict, warn, report
    #[error(transparent)]
    InvalidMode(#[from] InvalidModeError),

    /// Upstream URL does not parse or is not http(s)
    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    /// Contract location given as a URL does not parse
    #[error("invalid spec URL '{url}': {reason}")]
    InvalidSpecUrl { url: String, reason: String },

    /// Contract could not be loaded or compiled
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// Remote contract is served from a different origin than the upstream
    #[error("spec URL ({spec}) does not match upstream URL ({upstream})")]
    OriginMismatch { spec: String, upstream: String },

    /// TLS client configuration failed
    #[error("failed to configure TLS: {0}")]
    Tls(String),
}

/// Hard failures of the response-interception hook.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// Body read failed below the size ceiling
    #[error(transparent)]
    Transport(#[from] GuardError),

    /// Resolver failed for a reason other than an undocumented endpoint
    #[error("route finding error: {0}")]
    Resolver(#[from] ResolveError),

    /// Client went away or the validation deadline elapsed
    #[error("validation abandoned: {0}")]
    Cancelled(&'static str),
}

/// Errors surfaced to the downstream client.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Inbound request could not be turned into an upstream request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream unreachable or connection failed
    #[error("upstream connection failed: {0}")]
    Upstream(String),

    /// Upstream did not produce response headers in time
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    /// Interception aborted on a transport failure
    #[error(transparent)]
    Intercept(#[from] InterceptError),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl ProxyError {
    /// HTTP status the client receives for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Intercept(InterceptError::Transport(GuardError::TimedOut(_))) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::Intercept(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Build the client-facing response. Carries only the status reason;
    /// internal detail stays in the logs.
    pub fn to_response(&self) -> Response<ProxyBody> {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Proxy Error");
        let body = serde_json::to_vec(&ErrorBody { error: reason })
            .unwrap_or_else(|_| br#"{"error":"Proxy Error"}"#.to_vec());

        let mut response = Response::new(proxy_body::full(body.clone()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, body.len().into());
        response
    }
}
