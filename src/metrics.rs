//! Prometheus counters for validation outcomes and the `/metrics` endpoint.
//!
//! Counters are recorded in every mode, so `report` mode gets its numbers
//! without touching responses. With the `metrics` feature disabled the
//! recording functions compile to no-ops and `/metrics` renders nothing.

use std::net::SocketAddr;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters for the interception pipeline, held in a private registry.
#[cfg(feature = "metrics")]
pub struct PipelineMetrics {
    registry: Registry,
    /// `specgate_responses_total{outcome}`
    pub responses: IntCounterVec,
    /// `specgate_rewrites_total`
    pub rewrites: IntCounter,
}

#[cfg(feature = "metrics")]
impl PipelineMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let responses = IntCounterVec::new(
            Opts::new(
                "specgate_responses_total",
                "Responses seen by the interception pipeline, by outcome",
            ),
            &["outcome"],
        )?;
        let rewrites = IntCounter::new(
            "specgate_rewrites_total",
            "Responses replaced by a validation error in strict mode",
        )?;

        registry.register(Box::new(responses.clone()))?;
        registry.register(Box::new(rewrites.clone()))?;

        Ok(Self {
            registry,
            responses,
            rewrites,
        })
    }

    /// Text exposition of every registered counter.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(feature = "metrics")]
static PIPELINE_METRICS: Lazy<Option<PipelineMetrics>> =
    Lazy::new(|| match PipelineMetrics::new() {
        Ok(m) => Some(m),
        Err(e) => {
            error!(error = %e, "Failed to register pipeline metrics");
            None
        }
    });

/// Global pipeline metrics, if registration succeeded.
#[cfg(feature = "metrics")]
pub fn get_pipeline_metrics() -> Option<&'static PipelineMetrics> {
    PIPELINE_METRICS.as_ref()
}

/// Count one response under `outcome`.
pub fn record_outcome(outcome: &str) {
    #[cfg(feature = "metrics")]
    {
        if let Some(m) = get_pipeline_metrics() {
            m.responses.with_label_values(&[outcome]).inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    {
        let _ = outcome;
    }
}

pub fn record_rewrite() {
    #[cfg(feature = "metrics")]
    {
        if let Some(m) = get_pipeline_metrics() {
            m.rewrites.inc();
        }
    }
}

/// Current exposition text. Empty when metrics are compiled out.
pub fn render() -> Result<String, String> {
    #[cfg(feature = "metrics")]
    {
        match get_pipeline_metrics() {
            Some(m) => m.render().map_err(|e| e.to_string()),
            None => Ok(String::new()),
        }
    }
    #[cfg(not(feature = "metrics"))]
    {
        Ok(String::new())
    }
}

/// Router serving `GET /metrics` and `GET /health`.
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
}

/// Serve [`router`] on `addr` until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler() -> impl IntoResponse {
    match render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[cfg(feature = "metrics")]
    #[test]
    fn test_record_outcome_increments_counter() {
        let metrics = get_pipeline_metrics().unwrap();
        let before = metrics
            .responses
            .with_label_values(&["skipped_encoded"])
            .get();

        record_outcome("skipped_encoded");
        record_outcome("skipped_encoded");

        let after = metrics
            .responses
            .with_label_values(&["skipped_encoded"])
            .get();
        assert!(after >= before + 2);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_metrics_endpoint_exposes_counters() {
        record_outcome("passed");
        record_rewrite();

        let response = router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("specgate_responses_total{outcome=\"passed\"}"));
        assert!(text.contains("specgate_rewrites_total"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
