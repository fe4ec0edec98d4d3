//! SpecGate - validating reverse proxy for OpenAPI-described HTTP APIs.
//!
//! Requests are forwarded to an upstream unchanged. Responses are checked
//! against the contract before they reach the client.
//!
//! # Response Pipeline
//!
//! - **Guard:** only JSON bodies under the size ceiling are buffered.
//! - **Resolve:** the request is mapped to a documented operation.
//! - **Validate:** the buffered body is checked against the response schema.
//! - **Enforce:** `strict` rewrites failures as 500s, `warn` and `report`
//!   log them and pass the original response through.
//!
//! Every internal failure fails open: the client gets the upstream response.

pub mod config;
pub mod contract;
pub mod error;
pub mod guard;
pub mod logging;
pub mod logging_layer;
pub mod metrics;
pub mod policy;
pub mod proxy_body;
pub mod proxy_service;
pub mod resolver;
pub mod timeout;
pub mod validator;

pub use error::{ConfigError, InterceptError, ProxyError};
pub use logging::Logger;
pub use policy::{Mode, ValidationOutcome, parse_mode};
pub use proxy_service::ValidatingProxy;
