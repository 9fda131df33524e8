//! Kind-tag dispatch: routes an `OperationCall` to the handler registered for
//! its operation kind.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bulkops_core::{codes, OperationError, OperationKind, OperationValue};
use tower::Service;

use super::handler::{OperationCall, OperationHandler};

pub(crate) type DispatchFuture =
    Pin<Box<dyn Future<Output = Result<OperationValue, OperationError>> + Send>>;

// ---------------------------------------------------------------------------
// HandlerRouter
// ---------------------------------------------------------------------------

/// Lookup table from operation kind to handler, built once at startup.
///
/// Cloning is cheap: the table is shared behind an `Arc`. Calls for a kind
/// with no registered handler fail with `NO_HANDLER`.
#[derive(Clone, Default)]
pub struct HandlerRouter {
    handlers: Arc<HashMap<OperationKind, Arc<dyn OperationHandler>>>,
}

impl HandlerRouter {
    /// Create a new empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn register<H: OperationHandler>(&mut self, kind: OperationKind, handler: H) {
        self.register_arc(kind, Arc::new(handler));
    }

    /// Register a shared handler for `kind`.
    pub fn register_arc(&mut self, kind: OperationKind, handler: Arc<dyn OperationHandler>) {
        Arc::make_mut(&mut self.handlers).insert(kind, handler);
    }

    #[must_use]
    pub fn has_handler(&self, kind: OperationKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds, in declaration order.
    #[must_use]
    pub fn kinds(&self) -> Vec<OperationKind> {
        OperationKind::ALL
            .into_iter()
            .filter(|kind| self.has_handler(*kind))
            .collect()
    }
}

impl std::fmt::Debug for HandlerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRouter")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl Service<OperationCall> for HandlerRouter {
    type Response = OperationValue;
    type Error = OperationError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: OperationCall) -> Self::Future {
        let kind = call.kind();
        match self.handlers.get(&kind).cloned() {
            Some(handler) => Box::pin(async move { handler.handle(&call.action, &call.ctx).await }),
            None => Box::pin(async move {
                Err(OperationError::new(
                    codes::NO_HANDLER,
                    format!("no handler registered for {kind}"),
                ))
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
