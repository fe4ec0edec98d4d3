//! Validation modes and the enforcement policy.
//!
//! The policy maps a [`ValidationOutcome`] to one of two actions:
//!
//! - **PassThrough**: the upstream response reaches the client unchanged
//! - **Rewrite**: the response is replaced by a synthetic 500 error
//!
//! Only `Strict` mode combined with a genuine validation failure rewrites.
//! Every other combination, including all pipeline errors, passes through.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode, header};
use serde::Serialize;
use thiserror::Error;

use crate::logging::{Attr, Logger};
use crate::metrics;
use crate::proxy_body::{self, ProxyBody};

/// Fixed label carried in the `error` field of a rewritten body.
pub const ERROR_LABEL: &str = "Response validation failed";

/// How validation failures affect the outgoing response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Rewrite failing responses as 500 errors.
    Strict,
    /// Log failures, deliver the original response.
    Warn,
    /// Log and count failures, deliver the original response.
    Report,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Strict => "strict",
            Mode::Warn => "warn",
            Mode::Report => "report",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid mode '{0}': must be one of 'strict', 'warn', or 'report'")]
pub struct InvalidModeError(pub String);

/// Case-insensitive mode lookup. Empty input fails.
pub fn parse_mode(s: &str) -> Result<Mode, InvalidModeError> {
    if s.eq_ignore_ascii_case("strict") {
        Ok(Mode::Strict)
    } else if s.eq_ignore_ascii_case("warn") {
        Ok(Mode::Warn)
    } else if s.eq_ignore_ascii_case("report") {
        Ok(Mode::Report)
    } else {
        Err(InvalidModeError(s.to_string()))
    }
}

impl FromStr for Mode {
    type Err = InvalidModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_mode(s)
    }
}

/// Why a response was not validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotJson { content_type: String },
    /// `declared` is true when the size came from `Content-Length`.
    TooLarge { size: u64, declared: bool },
    Encoded { encoding: String },
    Undocumented { method: String, path: String },
}

impl SkipReason {
    /// Metric label for this reason.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NotJson { .. } => "skipped_not_json",
            SkipReason::TooLarge { .. } => "skipped_too_large",
            SkipReason::Encoded { .. } => "skipped_encoded",
            SkipReason::Undocumented { .. } => "skipped_undocumented",
        }
    }

    pub fn is_undocumented(&self) -> bool {
        matches!(self, SkipReason::Undocumented { .. })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotJson { .. } => f.write_str("non-JSON content type"),
            SkipReason::TooLarge { .. } => f.write_str("body too large"),
            SkipReason::Encoded { .. } => f.write_str("content-encoded body"),
            SkipReason::Undocumented { .. } => f.write_str("undocumented endpoint"),
        }
    }
}

/// Result of running one response through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Passed,
    Failed { detail: String },
    Skipped(SkipReason),
}

impl ValidationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ValidationOutcome::Passed => "passed",
            ValidationOutcome::Failed { .. } => "failed",
            ValidationOutcome::Skipped(reason) => reason.label(),
        }
    }
}

/// Action taken on the outgoing response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enforcement {
    PassThrough,
    Rewrite { detail: String },
}

/// Pure decision table: rewrite only for `Strict` + `Failed`.
pub fn decide(mode: Mode, outcome: &ValidationOutcome) -> Enforcement {
    match (mode, outcome) {
        (Mode::Strict, ValidationOutcome::Failed { detail }) => Enforcement::Rewrite {
            detail: detail.clone(),
        },
        _ => Enforcement::PassThrough,
    }
}

#[derive(Serialize)]
struct RewriteBody<'a> {
    error: &'a str,
    details: &'a str,
}

/// Serialize the synthetic error body. Key order is `error`, `details`.
pub fn rewrite_body(detail: &str) -> Bytes {
    serde_json::to_vec(&RewriteBody {
        error: ERROR_LABEL,
        details: detail,
    })
    .map(Bytes::from)
    .unwrap_or_else(|_| Bytes::from_static(br#"{"error":"Response validation failed"}"#))
}

/// Replace `response` with the synthetic 500.
///
/// Headers that describe the original body are dropped; everything else
/// the upstream sent is kept.
pub fn rewrite<B>(response: Response<B>, detail: &str) -> Response<ProxyBody> {
    let (mut parts, _original) = response.into_parts();
    let body = rewrite_body(detail);

    parts.status = StatusCode::INTERNAL_SERVER_ERROR;
    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.remove(header::TRANSFER_ENCODING);
    parts.headers.remove(header::ETAG);
    parts.headers.remove(header::LAST_MODIFIED);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    Response::from_parts(parts, proxy_body::full(body))
}

/// Applies the configured [`Mode`] to validation outcomes.
#[derive(Debug, Clone, Copy)]
pub struct EnforcementPolicy {
    mode: Mode,
}

impl EnforcementPolicy {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Log and count `outcome`, then return the response the client gets.
    pub fn enforce(
        &self,
        outcome: &ValidationOutcome,
        response: Response<ProxyBody>,
        logger: &Logger,
    ) -> Response<ProxyBody> {
        metrics::record_outcome(outcome.label());

        match outcome {
            ValidationOutcome::Passed => {
                logger.debug("Response validation passed", &[]);
            }
            ValidationOutcome::Skipped(SkipReason::Undocumented { .. }) => {
                logger.warn("Undocumented endpoint", &[]);
            }
            ValidationOutcome::Skipped(reason) => {
                logger.debug(
                    "Skipping validation",
                    &[Attr::new("reason", reason.to_string())],
                );
            }
            ValidationOutcome::Failed { detail } => {
                logger.error(
                    ERROR_LABEL,
                    &[
                        Attr::new("error", detail),
                        Attr::new("status", response.status()),
                        Attr::new("mode", self.mode.as_str()),
                    ],
                );
            }
        }

        match decide(self.mode, outcome) {
            Enforcement::PassThrough => response,
            Enforcement::Rewrite { detail } => {
                metrics::record_rewrite();
                rewrite(response, &detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{ColoredHandler, Level, SharedBuffer, Sink, strip_ansi};
    use http_body_util::BodyExt;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn capture() -> (Logger, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let handler = ColoredHandler::new(Sink::from(buffer.clone()), Level::Debug);
        (Logger::new(Arc::new(handler)), buffer)
    }

    fn upstream_response() -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .header(header::CONTENT_ENCODING, "identity")
            .header(header::ETAG, "\"abc123\"")
            .header(header::LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT")
            .header("x-upstream", "kept")
            .body(proxy_body::full(r#"{"name":"widget"}"#))
            .unwrap()
    }

    fn failed(detail: &str) -> ValidationOutcome {
        ValidationOutcome::Failed {
            detail: detail.to_string(),
        }
    }

    #[test]
    fn test_parse_mode_canonical() {
        assert_eq!(parse_mode("strict").unwrap(), Mode::Strict);
        assert_eq!(parse_mode("WARN").unwrap(), Mode::Warn);
        assert_eq!(parse_mode("RePoRt").unwrap(), Mode::Report);
        assert_eq!("Strict".parse::<Mode>().unwrap(), Mode::Strict);
    }

    #[test]
    fn test_parse_mode_rejects_empty_and_unknown() {
        assert_eq!(parse_mode(""), Err(InvalidModeError(String::new())));
        assert!(parse_mode("enforce").is_err());
        assert!(parse_mode(" strict").is_err());
        assert!(parse_mode("strictly").is_err());
    }

    #[test]
    fn test_mode_display_is_lowercase() {
        for mode in [Mode::Strict, Mode::Warn, Mode::Report] {
            assert_eq!(parse_mode(&mode.to_string()).unwrap(), mode);
            assert_eq!(mode.to_string(), mode.to_string().to_lowercase());
        }
    }

    proptest! {
        #[test]
        fn prop_parse_mode_ignores_case(
            idx in 0usize..3,
            upper in prop::collection::vec(any::<bool>(), 6),
        ) {
            let (name, expected) = [
                ("strict", Mode::Strict),
                ("warn", Mode::Warn),
                ("report", Mode::Report),
            ][idx];
            let variant: String = name
                .chars()
                .zip(upper.iter())
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            prop_assert_eq!(parse_mode(&variant).unwrap(), expected);
        }

        #[test]
        fn prop_parse_mode_rejects_other_strings(s in "\\PC{0,12}") {
            let lower = s.to_ascii_lowercase();
            prop_assume!(lower != "strict" && lower != "warn" && lower != "report");
            prop_assert!(parse_mode(&s).is_err());
        }
    }

    #[test]
    fn test_decide_table() {
        let undocumented = ValidationOutcome::Skipped(SkipReason::Undocumented {
            method: "GET".into(),
            path: "/x".into(),
        });
        let too_large = ValidationOutcome::Skipped(SkipReason::TooLarge {
            size: 1,
            declared: true,
        });

        for mode in [Mode::Strict, Mode::Warn, Mode::Report] {
            assert_eq!(decide(mode, &ValidationOutcome::Passed), Enforcement::PassThrough);
            assert_eq!(decide(mode, &undocumented), Enforcement::PassThrough);
            assert_eq!(decide(mode, &too_large), Enforcement::PassThrough);
        }
        assert_eq!(
            decide(Mode::Strict, &failed("bad")),
            Enforcement::Rewrite {
                detail: "bad".into()
            }
        );
        assert_eq!(decide(Mode::Warn, &failed("bad")), Enforcement::PassThrough);
        assert_eq!(decide(Mode::Report, &failed("bad")), Enforcement::PassThrough);
    }

    #[test]
    fn test_rewrite_body_exact_shape() {
        let body = rewrite_body("field 'id' required");
        insta::assert_snapshot!(
            String::from_utf8(body.to_vec()).unwrap(),
            @r#"{"error":"Response validation failed","details":"field 'id' required"}"#
        );
    }

    #[tokio::test]
    async fn test_strict_failure_rewrites_response() {
        let (logger, logs) = capture();
        let policy = EnforcementPolicy::new(Mode::Strict);

        let response = policy.enforce(&failed("field 'id' required"), upstream_response(), &logger);

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let headers = response.headers().clone();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert!(headers.get(header::CONTENT_ENCODING).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::ETAG).is_none());
        assert!(headers.get(header::LAST_MODIFIED).is_none());
        assert_eq!(headers.get("x-upstream").unwrap(), "kept");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &body[..],
            br#"{"error":"Response validation failed","details":"field 'id' required"}"#
        );
        assert_eq!(
            headers.get(header::CONTENT_LENGTH).unwrap(),
            body.len().to_string().as_str()
        );

        let lines: Vec<String> = logs.lines().iter().map(|l| strip_ansi(l)).collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("ERROR Response validation failed error=field 'id' required"));
    }

    #[tokio::test]
    async fn test_warn_and_report_pass_failures_through() {
        for mode in [Mode::Warn, Mode::Report] {
            let (logger, logs) = capture();
            let policy = EnforcementPolicy::new(mode);

            let response = policy.enforce(&failed("field 'id' required"), upstream_response(), &logger);

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers().get(header::ETAG).unwrap(), "\"abc123\"");
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], br#"{"name":"widget"}"#);

            let out = strip_ansi(&logs.contents());
            assert!(out.contains("ERROR Response validation failed error=field 'id' required"));
            assert!(out.contains(&format!("mode={mode}")));
        }
    }

    #[tokio::test]
    async fn test_undocumented_logs_warn_in_every_mode() {
        for mode in [Mode::Strict, Mode::Warn, Mode::Report] {
            let (logger, logs) = capture();
            let outcome = ValidationOutcome::Skipped(SkipReason::Undocumented {
                method: "GET".into(),
                path: "/x".into(),
            });

            let response = EnforcementPolicy::new(mode).enforce(&outcome, upstream_response(), &logger);

            assert_eq!(response.status(), StatusCode::OK);
            let out = strip_ansi(&logs.contents());
            assert!(out.contains("WARN Undocumented endpoint"));
            assert!(!out.contains("ERROR"));
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ValidationOutcome::Passed.label(), "passed");
        assert_eq!(failed("x").label(), "failed");
        assert_eq!(
            ValidationOutcome::Skipped(SkipReason::Encoded {
                encoding: "br".into()
            })
            .label(),
            "skipped_encoded"
        );
    }
}
