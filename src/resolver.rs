//! Operation resolution and resolver-failure classification.
//!
//! [`OperationResolver`] maps an inbound request to a documented operation.
//! Failures carry a typed "undocumented" signal where possible; resolvers
//! that only produce text go through [`is_undocumented_message`].

use http::{HeaderMap, Method, Request, Uri};
use regex::Regex;
use thiserror::Error;

use crate::contract::{Contract, ContractError};

/// Snapshot of the originating request, taken before its body is forwarded.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self::new(req.method().clone(), req.uri().clone(), req.headers().clone())
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// A resolved operation with its path parameters in template order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub operation_id: String,
    pub path_params: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no matching operation was found for path {path}")]
    NotFound { path: String },

    #[error("method {method} is not documented for path {path}")]
    MethodNotAllowed { method: String, path: String },

    /// Free-text failure from a resolver without typed errors.
    #[error("{0}")]
    Other(String),
}

impl ResolveError {
    /// Returns `true` if the failure means "not in the contract" rather
    /// than a resolver malfunction.
    pub fn is_undocumented(&self) -> bool {
        match self {
            ResolveError::NotFound { .. } | ResolveError::MethodNotAllowed { .. } => true,
            ResolveError::Other(message) => is_undocumented_message(message),
        }
    }
}

/// Best-effort match of free-text resolver errors against known
/// "not documented" phrasings. Case-insensitive substring match.
pub fn is_undocumented_message(message: &str) -> bool {
    const PATTERNS: [&str; 6] = [
        "no matching operation",
        "path not found",
        "no route found",
        "operation not found",
        "no match found",
        "unknown path",
    ];

    let message = message.to_lowercase();
    PATTERNS.iter().any(|p| message.contains(p))
}

/// Maps a request to a documented operation.
pub trait OperationResolver: Send + Sync {
    fn resolve(&self, request: &RequestHead) -> Result<RouteMatch, ResolveError>;
}

#[derive(Debug)]
struct CompiledRoute {
    pattern: Regex,
    params: Vec<String>,
    /// Method to operation id.
    methods: Vec<(Method, String)>,
}

/// Resolver over a contract's path templates.
///
/// Routes with fewer parameters are tried first, so `/pets/mine` wins over
/// `/pets/{id}` for the same method.
#[derive(Debug)]
pub struct TemplateResolver {
    base_path: String,
    routes: Vec<CompiledRoute>,
}

impl TemplateResolver {
    pub fn new(contract: &Contract) -> Result<Self, ContractError> {
        let mut routes: Vec<(String, CompiledRoute)> = Vec::new();

        for op in contract.operations() {
            if let Some((_, route)) = routes.iter_mut().find(|(t, _)| *t == op.path_template) {
                route.methods.push((op.method.clone(), op.id.clone()));
                continue;
            }
            let (pattern, params) = compile_template(&op.path_template)?;
            routes.push((
                op.path_template.clone(),
                CompiledRoute {
                    pattern,
                    params,
                    methods: vec![(op.method.clone(), op.id.clone())],
                },
            ));
        }

        routes.sort_by(|(a_tpl, a), (b_tpl, b)| {
            a.params
                .len()
                .cmp(&b.params.len())
                .then_with(|| b_tpl.len().cmp(&a_tpl.len()))
        });

        Ok(Self {
            base_path: contract.base_path(),
            routes: routes.into_iter().map(|(_, r)| r).collect(),
        })
    }

    /// Request path relative to the contract's base path.
    fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.base_path.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.base_path.as_str())?;
        match rest {
            "" => Some("/"),
            r if r.starts_with('/') => Some(r),
            _ => None,
        }
    }
}

impl OperationResolver for TemplateResolver {
    fn resolve(&self, request: &RequestHead) -> Result<RouteMatch, ResolveError> {
        let path = request.path();
        let not_found = || ResolveError::NotFound {
            path: path.to_string(),
        };
        let relative = self.relative(path).ok_or_else(not_found)?;

        let mut path_matched = false;
        for route in &self.routes {
            let Some(captures) = route.pattern.captures(relative) else {
                continue;
            };
            path_matched = true;

            let Some((_, id)) = route.methods.iter().find(|(m, _)| *m == request.method) else {
                continue;
            };
            let path_params = route
                .params
                .iter()
                .zip(captures.iter().skip(1))
                .filter_map(|(name, value)| value.map(|v| (name.clone(), v.as_str().to_string())))
                .collect();
            return Ok(RouteMatch {
                operation_id: id.clone(),
                path_params,
            });
        }

        if path_matched {
            Err(ResolveError::MethodNotAllowed {
                method: request.method.to_string(),
                path: path.to_string(),
            })
        } else {
            Err(not_found())
        }
    }
}

/// `/pets/{petId}` becomes `^/pets/([^/]+)$` with params `["petId"]`.
fn compile_template(template: &str) -> Result<(Regex, Vec<String>), ContractError> {
    let mut pattern = String::from("^");
    let mut params = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let close = rest[open..].find('}').map(|i| open + i).ok_or_else(|| {
            ContractError::Invalid(format!("unclosed parameter in path '{template}'"))
        })?;
        pattern.push_str(&regex::escape(&rest[..open]));
        pattern.push_str("([^/]+)");
        params.push(rest[open + 1..close].to_string());
        rest = &rest[close + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push('$');

    let regex = Regex::new(&pattern)
        .map_err(|e| ContractError::Invalid(format!("path '{template}': {e}")))?;
    Ok((regex, params))
}
