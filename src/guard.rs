//! Response Guard: eligibility gates and bounded buffering of upstream bodies.
//!
//! A response is materialized only when it is declared JSON, is not
//! content-encoded, and fits under the byte ceiling. Anything else is handed
//! back untouched (or, after an overflow, re-assembled) so the client always
//! receives the upstream bytes.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, header};
use http_body_util::BodyExt;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::logging::{Attr, Logger};
use crate::policy::SkipReason;
use crate::proxy_body::{self, BoxError, ProxyBody};
use crate::timeout::{BodyDeadline, DeadlineBody};

/// Default byte ceiling for buffered bodies (10 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Body read failure below the ceiling. Aborts interception for the response.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("failed to read upstream body: {0}")]
    Read(BoxError),

    #[error("upstream body read timed out: {0}")]
    TimedOut(String),
}

impl GuardError {
    fn from_read(err: BoxError) -> Self {
        match err.downcast_ref::<std::io::Error>() {
            Some(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                GuardError::TimedOut(io.to_string())
            }
            _ => GuardError::Read(err),
        }
    }
}

/// Result of running a response through the guard.
#[derive(Debug)]
pub enum Guarded {
    /// Fully read. `body` can be cloned for every later reader.
    Buffered {
        body: Bytes,
        trailers: Option<HeaderMap>,
    },
    /// Not eligible. `body` yields exactly what the upstream sent.
    Skipped { reason: SkipReason, body: ProxyBody },
}

/// Size and content-type gate in front of the validator.
#[derive(Debug, Clone, Copy)]
pub struct ResponseGuard {
    max_body_bytes: usize,
    deadline: BodyDeadline,
}

impl Default for ResponseGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_BYTES, BodyDeadline::default())
    }
}

impl ResponseGuard {
    pub fn new(max_body_bytes: usize, deadline: BodyDeadline) -> Self {
        Self {
            max_body_bytes,
            deadline,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.max_body_bytes,
            BodyDeadline::new(config.body_idle_timeout, config.body_total_timeout),
        )
    }

    /// Header-only gates: content type, content encoding, declared length.
    ///
    /// Returns `None` when the body should be read.
    pub fn check_headers(&self, headers: &HeaderMap) -> Option<SkipReason> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !is_json(content_type) {
            return Some(SkipReason::NotJson {
                content_type: content_type.to_string(),
            });
        }

        if let Some(encoding) = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
        {
            let encoding = encoding.trim();
            if !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity") {
                return Some(SkipReason::Encoded {
                    encoding: encoding.to_string(),
                });
            }
        }

        match declared_length(headers) {
            Some(len) if len > self.max_body_bytes as u64 => Some(SkipReason::TooLarge {
                size: len,
                declared: true,
            }),
            _ => None,
        }
    }

    /// Apply every gate and, when eligible, read the body into memory.
    ///
    /// The read stops one frame past the ceiling. A body skipped at that
    /// point is rebuilt from the bytes already read plus the unread rest of
    /// the stream.
    pub async fn materialize(
        &self,
        headers: &HeaderMap,
        body: ProxyBody,
        logger: &Logger,
    ) -> Result<Guarded, GuardError> {
        if let Some(reason) = self.check_headers(headers) {
            if let SkipReason::TooLarge { size, declared } = &reason {
                warn_too_large(logger, *size, *declared, self.max_body_bytes);
            }
            return Ok(Guarded::Skipped { reason, body });
        }

        let capacity = declared_length(headers)
            .map(|len| len as usize)
            .unwrap_or(0)
            .min(self.max_body_bytes);
        let mut buf = BytesMut::with_capacity(capacity);
        let mut trailers: Option<HeaderMap> = None;
        let mut body = DeadlineBody::new(body, self.deadline);

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(GuardError::from_read)?;
            let frame = match frame.into_data() {
                Ok(data) => {
                    buf.extend_from_slice(&data);
                    if buf.len() > self.max_body_bytes {
                        let size = buf.len() as u64;
                        warn_too_large(logger, size, false, self.max_body_bytes);
                        let rest = body.into_inner();
                        return Ok(Guarded::Skipped {
                            reason: SkipReason::TooLarge {
                                size,
                                declared: false,
                            },
                            body: proxy_body::prepend(buf.freeze(), rest),
                        });
                    }
                    continue;
                }
                Err(frame) => frame,
            };
            if let Ok(t) = frame.into_trailers() {
                trailers.get_or_insert_with(HeaderMap::new).extend(t);
            }
        }

        Ok(Guarded::Buffered {
            body: buf.freeze(),
            trailers,
        })
    }
}

fn warn_too_large(logger: &Logger, size: u64, declared: bool, limit: usize) {
    logger.warn(
        "Response too large, skipping validation",
        &[
            Attr::new("size", size),
            Attr::new("declared", declared),
            Attr::new("limit", limit),
        ],
    );
}

/// `Content-Type` contains `application/json`, ignoring ASCII case.
pub fn is_json(content_type: &str) -> bool {
    content_type
        .to_ascii_lowercase()
        .contains("application/json")
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}
