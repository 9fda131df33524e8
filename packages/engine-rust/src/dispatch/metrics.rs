//! Instrumentation layer for handler calls.
//!
//! Wraps each call in a `tracing` span and records an outcome counter and a
//! duration histogram through the `metrics` facade. No recorder is installed
//! here; without one the `metrics` calls are no-ops.

use std::task::{Context, Poll};
use std::time::Instant;

use bulkops_core::{OperationError, OperationValue};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::handler::OperationCall;
use super::router::DispatchFuture;

/// Counter of settled handler calls, labelled by `kind` and `outcome`.
pub const OPERATIONS_TOTAL: &str = "bulkops_operations_total";

/// Histogram of handler call durations in milliseconds, labelled by `kind`.
pub const OPERATION_DURATION_MS: &str = "bulkops_operation_duration_ms";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<OperationCall> for MetricsService<S>
where
    S: Service<OperationCall, Response = OperationValue, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationValue;
    type Error = OperationError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: OperationCall) -> Self::Future {
        let kind = call.kind().as_str();
        let span = info_span!(
            "operation",
            request_id = %call.ctx.request_id,
            operation_id = %call.ctx.operation_id,
            kind = kind,
            attempt = call.ctx.attempt,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(_) => "error",
                };

                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                if let Err(err) = &result {
                    tracing::debug!(code = %err.code, "handler returned error");
                }

                metrics::counter!(OPERATIONS_TOTAL, "kind" => kind, "outcome" => outcome)
                    .increment(1);
                #[allow(clippy::cast_precision_loss)]
                let duration_f64 = duration_ms as f64;
                metrics::histogram!(OPERATION_DURATION_MS, "kind" => kind).record(duration_f64);

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use bulkops_core::{codes, CreatePayload, OperationAction};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::handler::HandlerContext;

    /// Succeeds unless the created record is named `"bad"`.
    struct PickyService;

    impl Service<OperationCall> for PickyService {
        type Response = OperationValue;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationValue, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, call: OperationCall) -> Self::Future {
            let OperationAction::Create(payload) = call.action else {
                return Box::pin(async { Err(OperationError::new(codes::INVALID_PAYLOAD, "not a create")) });
            };
            Box::pin(async move {
                match payload.record_id.as_deref() {
                    Some("bad") => Err(OperationError::new(codes::CONFLICT, "bad id")),
                    id => Ok(OperationValue::new(id.unwrap_or("generated"), payload.data)),
                }
            })
        }
    }

    fn create(id: &str) -> OperationCall {
        OperationCall {
            ctx: HandlerContext::new("req", id),
            action: OperationAction::Create(CreatePayload {
                entity: "plans".to_string(),
                record_id: Some(id.to_string()),
                data: json!({"n": 1}),
                assignment: None,
            }),
        }
    }

    #[tokio::test]
    async fn passes_through_success() {
        let svc = MetricsLayer.layer(PickyService);
        let value = svc.oneshot(create("good")).await.unwrap();
        assert_eq!(value.record_id.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn passes_through_error() {
        let svc = MetricsLayer.layer(PickyService);
        let err = svc.oneshot(create("bad")).await.unwrap_err();
        assert_eq!(err.code, codes::CONFLICT);
    }
}
