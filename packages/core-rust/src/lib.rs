//! Bulkops core: operation model, dependency resolution, chunking, and
//! pre-flight validation for batch requests.

pub mod chunker;
pub mod resolver;
pub mod result;
pub mod traits;
pub mod types;
pub mod validator;

pub use resolver::{order_operations, resolve_order, ResolveError};
pub use result::{
    codes, BatchError, BatchResponse, BatchStatus, BatchSummary, FieldError, OperationError,
    OperationResult, OperationStatus, OperationValue, ProgressSnapshot, RollbackSummary,
};
pub use traits::{ComplianceReport, CompletionNotifier, PolicyCheck, ProgressObserver};
pub use types::{
    now_millis, Assignment, AssignPayload, BatchOptions, BatchRequest, CreatePayload,
    DeletePayload, DuplicatePayload, Operation, OperationAction, OperationKind, Priority,
    RequestMetadata, SchedulePayload, TemplatePayload, UpdatePayload,
};
pub use validator::{validate, validate_json, ResourceEstimate, ValidationIssue, ValidationReport};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
