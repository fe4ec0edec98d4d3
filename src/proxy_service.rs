//! The validating reverse proxy.
//!
//! Requests are forwarded to the upstream with only scheme, authority and
//! hop-by-hop headers changed. Each upstream response then runs through the
//! interception pipeline:
//!
//! 1. [`ResponseGuard`] decides eligibility and buffers the body
//! 2. [`OperationResolver`] maps the request to a documented operation
//! 3. [`SchemaValidator`] checks the buffered response
//! 4. [`EnforcementPolicy`] logs the outcome and may rewrite the response
//!
//! The pipeline stops at the first skip. Any failure other than a body read
//! error lets the original response through.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version, header};
use http_body::Body;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use url::Url;

use crate::config::RuntimeConfig;
use crate::contract::Contract;
use crate::error::{ConfigError, InterceptError, ProxyError};
use crate::guard::{Guarded, ResponseGuard};
use crate::logging::{Attr, Logger};
use crate::logging_layer::X_REQUEST_ID;
use crate::metrics;
use crate::policy::{EnforcementPolicy, Mode, SkipReason, ValidationOutcome, parse_mode};
use crate::proxy_body::{self, BoxError, ProxyBody};
use crate::resolver::{OperationResolver, RequestHead, TemplateResolver};
use crate::validator::{JsonSchemaValidator, SchemaValidator, ValidationInput};

type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Peer address of the downstream connection, set as a request extension.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Parsed upstream target. Only scheme and authority are used.
#[derive(Debug, Clone)]
pub struct Upstream {
    url: String,
    scheme: Scheme,
    authority: Authority,
}

impl Upstream {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUpstream {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            url: url.to_string(),
            scheme: Scheme::from_str(parsed.scheme()).map_err(|e| invalid(e.to_string()))?,
            authority: Authority::from_str(&authority).map_err(|e| invalid(e.to_string()))?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// `original` with scheme and authority replaced. Path and query are kept.
    pub fn target_uri(&self, original: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))
    }
}

/// Immutable proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream: Upstream,
    pub mode: Mode,
    pub contract: Arc<Contract>,
    pub runtime: RuntimeConfig,
}

struct Inner {
    config: ProxyConfig,
    resolver: Arc<dyn OperationResolver>,
    validator: Arc<dyn SchemaValidator>,
    guard: ResponseGuard,
    policy: EnforcementPolicy,
    client: HttpClient,
    logger: Logger,
}

/// Reverse proxy validating every upstream response against a contract.
///
/// Cheap to clone; clones share configuration and the upstream pool.
#[derive(Clone)]
pub struct ValidatingProxy {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ValidatingProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatingProxy")
            .field("upstream", &self.inner.config.upstream.as_str())
            .field("mode", &self.inner.config.mode)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ValidatingProxy`].
pub struct ValidatingProxyBuilder {
    contract: Contract,
    upstream: String,
    mode: String,
    logger: Option<Logger>,
    runtime: RuntimeConfig,
    resolver: Option<Arc<dyn OperationResolver>>,
    validator: Option<Arc<dyn SchemaValidator>>,
}

impl ValidatingProxyBuilder {
    /// Logger every pipeline stage reports through. Defaults to stderr at Info.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Replace the contract-backed [`TemplateResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn OperationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the contract-backed [`JsonSchemaValidator`].
    pub fn validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Resolve the mode, parse the upstream, point the contract's servers at
    /// the upstream and compile the resolver and validator.
    pub fn build(self) -> Result<ValidatingProxy, ConfigError> {
        let mode = parse_mode(&self.mode)?;
        let upstream = Upstream::parse(&self.upstream)?;

        let mut contract = self.contract;
        contract.set_servers(vec![self.upstream.clone()]);

        let resolver: Arc<dyn OperationResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(TemplateResolver::new(&contract)?),
        };
        let validator: Arc<dyn SchemaValidator> = match self.validator {
            Some(validator) => validator,
            None => Arc::new(JsonSchemaValidator::new(&contract)?),
        };

        let guard = ResponseGuard::from_config(&self.runtime);
        let logger = self
            .logger
            .unwrap_or_else(|| Logger::stderr(crate::logging::Level::Info));

        Ok(ValidatingProxy {
            inner: Arc::new(Inner {
                config: ProxyConfig {
                    upstream,
                    mode,
                    contract: Arc::new(contract),
                    runtime: self.runtime,
                },
                resolver,
                validator,
                guard,
                policy: EnforcementPolicy::new(mode),
                client: build_client()?,
                logger,
            }),
        })
    }
}

fn build_client() -> Result<HttpClient, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = match hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_native_roots(Arc::clone(&provider))
    {
        Ok(builder) => builder,
        Err(e) => {
            tracing::warn!(error = %e, "No native root certificates found, HTTPS upstreams will fail verification");
            let tls = rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| ConfigError::Tls(e.to_string()))?
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth();
            hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls)
        }
    };

    let https = builder
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// `err` and its sources, joined with `": "`.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP_HEADERS.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

impl ValidatingProxy {
    pub fn new(contract: Contract, upstream: &str, mode: &str) -> Result<Self, ConfigError> {
        Self::builder(contract, upstream, mode).build()
    }

    pub fn builder(contract: Contract, upstream: &str, mode: &str) -> ValidatingProxyBuilder {
        ValidatingProxyBuilder {
            contract,
            upstream: upstream.to_string(),
            mode: mode.to_string(),
            logger: None,
            runtime: RuntimeConfig::default(),
            resolver: None,
            validator: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> Mode {
        self.inner.config.mode
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Logger bound to the request's method, path and correlation id.
    fn request_logger(&self, head: &RequestHead) -> Logger {
        let mut attrs = vec![
            Attr::new("method", &head.method),
            Attr::new("path", head.path()),
        ];
        if let Some(id) = head.headers.get(&X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
            attrs.push(Attr::new("request_id", id));
        }
        self.inner.logger.with(&attrs)
    }

    /// Forward `req` and run the response through the pipeline. Errors map
    /// to client responses via [`ProxyError::to_response`].
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        cancel: CancellationToken,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let head = RequestHead::from_request(&req);
        let logger = self.request_logger(&head);
        let upstream_req = self.upstream_request(req)?;

        let timeout = self.inner.config.runtime.upstream_timeout;
        let response =
            match tokio::time::timeout(timeout, self.inner.client.request(upstream_req)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    logger.error(
                        "Upstream request failed",
                        &[Attr::new("error", error_chain(&e))],
                    );
                    metrics::record_outcome("transport_error");
                    return Err(ProxyError::Upstream(e.to_string()));
                }
                Err(_) => {
                    logger.error(
                        "Upstream timed out",
                        &[Attr::new("timeout_ms", timeout.as_millis() as u64)],
                    );
                    metrics::record_outcome("transport_error");
                    return Err(ProxyError::UpstreamTimeout(timeout));
                }
            };

        let mut response = response.map(proxy_body::boxed);
        strip_hop_by_hop(response.headers_mut());

        Ok(self.run_pipeline(&head, response, &cancel, &logger).await?)
    }

    /// Convenience over [`handle`](Self::handle) that renders errors.
    pub async fn serve<B>(&self, req: Request<B>, cancel: CancellationToken) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match self.handle(req, cancel).await {
            Ok(response) => response,
            Err(e) => e.to_response(),
        }
    }

    /// The response-interception hook, callable on any upstream response.
    ///
    /// Returns `Err` only when the body could not be read; every other
    /// failure yields the original response.
    pub async fn intercept(
        &self,
        head: &RequestHead,
        response: Response<ProxyBody>,
        cancel: &CancellationToken,
    ) -> Result<Response<ProxyBody>, InterceptError> {
        let logger = self.request_logger(head);
        self.run_pipeline(head, response, cancel, &logger).await
    }

    fn upstream_request<B>(&self, req: Request<B>) -> Result<Request<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let upstream = &self.inner.config.upstream;
        let client_addr = req.extensions().get::<ClientAddr>().copied();
        let (mut parts, body) = req.into_parts();

        parts.uri = upstream.target_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);

        let host = HeaderValue::from_str(upstream.authority().as_str())
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        parts.headers.insert(header::HOST, host);

        if let Some(ClientAddr(addr)) = client_addr {
            let forwarded = match parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(prior) => format!("{prior}, {}", addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                parts.headers.insert("x-forwarded-for", value);
            }
        }

        Ok(Request::from_parts(parts, proxy_body::boxed(body)))
    }

    async fn run_pipeline(
        &self,
        head: &RequestHead,
        response: Response<ProxyBody>,
        cancel: &CancellationToken,
        logger: &Logger,
    ) -> Result<Response<ProxyBody>, InterceptError> {
        let policy = &self.inner.policy;
        let (parts, body) = response.into_parts();

        let guarded = match self.inner.guard.materialize(&parts.headers, body, logger).await {
            Ok(guarded) => guarded,
            Err(e) => {
                logger.error(
                    "Failed to read upstream response body",
                    &[Attr::new("error", e.to_string())],
                );
                metrics::record_outcome("transport_error");
                return Err(e.into());
            }
        };

        let (data, trailers) = match guarded {
            Guarded::Skipped { reason, body } => {
                let response = Response::from_parts(parts, body);
                return Ok(policy.enforce(&ValidationOutcome::Skipped(reason), response, logger));
            }
            Guarded::Buffered { body, trailers } => (body, trailers),
        };

        let evaluated = self
            .evaluate(head, parts.status, &parts.headers, &data, cancel)
            .await;
        let response = Response::from_parts(parts, proxy_body::replay(data, trailers));

        match evaluated {
            Ok(outcome) => Ok(policy.enforce(&outcome, response, logger)),
            Err(InterceptError::Resolver(e)) => {
                logger.error("Error finding route", &[Attr::new("error", e.to_string())]);
                metrics::record_outcome("resolver_error");
                Ok(response)
            }
            Err(InterceptError::Cancelled(reason)) => {
                logger.warn("Validation abandoned", &[Attr::new("reason", reason)]);
                metrics::record_outcome("cancelled");
                Ok(response)
            }
            Err(e @ InterceptError::Transport(_)) => Err(e),
        }
    }

    /// Resolve and validate an already-buffered response.
    async fn evaluate(
        &self,
        head: &RequestHead,
        status: StatusCode,
        headers: &HeaderMap,
        body: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, InterceptError> {
        let route = match self.inner.resolver.resolve(head) {
            Ok(route) => route,
            Err(e) if e.is_undocumented() => {
                return Ok(ValidationOutcome::Skipped(SkipReason::Undocumented {
                    method: head.method.to_string(),
                    path: head.path().to_string(),
                }));
            }
            Err(e) => return Err(e.into()),
        };

        let input = ValidationInput {
            operation_id: &route.operation_id,
            path_params: &route.path_params,
            request_headers: &head.headers,
            status,
            response_headers: headers,
            body,
        };
        let deadline = self.inner.config.runtime.validation_timeout;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InterceptError::Cancelled("client disconnected")),
            result = tokio::time::timeout(deadline, self.inner.validator.validate(input)) => {
                match result {
                    Ok(Ok(())) => Ok(ValidationOutcome::Passed),
                    Ok(Err(e)) => Ok(ValidationOutcome::Failed { detail: e.detail }),
                    Err(_) => Err(InterceptError::Cancelled("validation timed out")),
                }
            }
        }
    }
}

impl<B> Service<Request<B>> for ValidatingProxy
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    /// The connection's [`CancellationToken`] is taken from the request
    /// extensions when present.
    fn call(&mut self, req: Request<B>) -> Self::Future {
        let proxy = self.clone();
        let cancel = req
            .extensions()
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(proxy.serve(req, cancel).await) })
    }
}
