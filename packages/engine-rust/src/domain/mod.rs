//! In-memory reference domain used by the CLI and the test suite.

pub mod handlers;
pub mod policy;
pub mod store;

use std::sync::Arc;

use bulkops_core::OperationKind;

pub use handlers::{
    AssignHandler, CreateHandler, DeleteHandler, DuplicateHandler, ScheduleHandler,
    TemplateHandler, UpdateHandler,
};
pub use policy::RulePolicy;
pub use store::MemoryStore;

use crate::dispatch::HandlerRouter;

/// Router with a handler for every operation kind, all sharing `store`.
#[must_use]
pub fn memory_router(store: &Arc<MemoryStore>) -> HandlerRouter {
    let mut router = HandlerRouter::new();
    router.register(OperationKind::Create, CreateHandler::new(Arc::clone(store)));
    router.register(OperationKind::Update, UpdateHandler::new(Arc::clone(store)));
    router.register(OperationKind::Delete, DeleteHandler::new(Arc::clone(store)));
    router.register(OperationKind::Assign, AssignHandler::new(Arc::clone(store)));
    router.register(OperationKind::Schedule, ScheduleHandler::new(Arc::clone(store)));
    router.register(OperationKind::Duplicate, DuplicateHandler::new(Arc::clone(store)));
    router.register(OperationKind::Template, TemplateHandler::new(Arc::clone(store)));
    router
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_router_covers_every_kind() {
        let router = memory_router(&Arc::new(MemoryStore::new()));
        for kind in OperationKind::ALL {
            assert!(router.has_handler(kind), "{kind} missing");
        }
    }
}
