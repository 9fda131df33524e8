//! Operation dispatch: handler trait, kind router, instrumentation, and the
//! per-job concurrency gate.
//!
//! 1. **Handlers** (`handler`): one `OperationHandler` per operation kind
//! 2. **Routing** (`router`): `OperationKind` -> handler lookup as a `tower::Service`
//! 3. **Instrumentation** (`metrics`): tracing span + counters around each call
//! 4. **Limiter** (`limiter`): semaphore bounding concurrent calls

pub mod handler;
pub mod limiter;
pub mod metrics;
pub mod router;

use tower::ServiceBuilder;

pub use handler::{wrong_kind, HandlerContext, OperationCall, OperationHandler};
pub use limiter::{ConcurrencyLimiter, LimiterClosed, LimiterPermit};
pub use metrics::{MetricsLayer, MetricsService};
pub use router::HandlerRouter;

/// The service stack every operation call passes through.
pub type DispatchService = MetricsService<HandlerRouter>;

/// Wraps the router with the instrumentation layer.
///
/// Concurrency is bounded by the caller with a [`ConcurrencyLimiter`] rather
/// than a tower layer, because waiting for a slot must happen after an
/// operation's in-chunk prerequisites settle.
#[must_use]
pub fn build_dispatch_pipeline(router: HandlerRouter) -> DispatchService {
    ServiceBuilder::new().layer(MetricsLayer).service(router)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bulkops_core::{
        OperationAction, OperationError, OperationKind, OperationValue, TemplatePayload,
    };
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    struct TemplateStub;

    #[async_trait]
    impl OperationHandler for TemplateStub {
        async fn handle(
            &self,
            action: &OperationAction,
            _ctx: &HandlerContext,
        ) -> Result<OperationValue, OperationError> {
            Ok(OperationValue::new("tpl-copy", json!({ "kind": action.kind().as_str() })))
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_layers() {
        let mut router = HandlerRouter::new();
        router.register(OperationKind::Template, TemplateStub);
        let svc = build_dispatch_pipeline(router);

        let call = OperationCall {
            ctx: HandlerContext::new("req", "op"),
            action: OperationAction::Template(TemplatePayload {
                entity: "plans".to_string(),
                template_id: "weekly".to_string(),
                variables: serde_json::Map::new(),
            }),
        };
        let value = svc.oneshot(call).await.unwrap();
        assert_eq!(value.data["kind"], "TEMPLATE");
    }
}
