//! Prometheus metrics endpoint

use axum::{
    Router,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::error::AppError;
use crate::metrics::REGISTRY;

/// GET /metrics
///
/// Every registered family in Prometheus text format.
async fn metrics_handler() -> Result<Response, AppError> {
    let encoder = TextEncoder::new();
    let metrics_text = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to encode metrics");
            AppError::Internal(anyhow::anyhow!("metrics encoding failed: {}", e))
        })?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        metrics_text,
    )
        .into_response())
}

/// Create metrics router
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_serves_registered_families() {
        crate::metrics::init_metrics();
        crate::metrics::INBOX_QUEUE_REJECTED
            .with_label_values(&["full"])
            .inc();

        let response = metrics_router::<()>()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("driftwood_inbox_queue_rejected_total"));
    }
}
