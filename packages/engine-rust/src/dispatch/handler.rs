//! Handler interface implemented by the domain layer, one per operation kind.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bulkops_core::{
    codes, Assignment, OperationAction, OperationError, OperationKind, OperationValue, PolicyCheck,
    Priority,
};

/// Per-call context handed to a handler alongside the action.
#[derive(Clone)]
pub struct HandlerContext {
    pub request_id: Arc<str>,
    pub operation_id: String,
    /// 0 for the first attempt, incremented on every retry.
    pub attempt: u32,
    pub priority: Priority,
    pub policy: Option<Arc<dyn PolicyCheck>>,
}

impl HandlerContext {
    pub fn new(request_id: impl Into<Arc<str>>, operation_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            operation_id: operation_id.into(),
            attempt: 0,
            priority: Priority::default(),
            policy: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Option<Arc<dyn PolicyCheck>>) -> Self {
        self.policy = policy;
        self
    }

    /// Runs the request's policy check, if any, against an assignment.
    ///
    /// # Errors
    ///
    /// Returns a `POLICY_VIOLATION` error listing the issues when the policy
    /// rejects the assignment.
    pub fn ensure_compliant(&self, entity: &str, assignment: &Assignment) -> Result<(), OperationError> {
        let Some(policy) = &self.policy else {
            return Ok(());
        };
        let report = policy.check(entity, assignment);
        if report.compliant {
            return Ok(());
        }
        Err(OperationError::new(codes::POLICY_VIOLATION, report.issues.join("; "))
            .with_suggestion("adjust the assignment so it satisfies the compliance policy"))
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("request_id", &self.request_id)
            .field("operation_id", &self.operation_id)
            .field("attempt", &self.attempt)
            .field("priority", &self.priority)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

/// One dispatch unit flowing through the handler pipeline.
#[derive(Debug, Clone)]
pub struct OperationCall {
    pub ctx: HandlerContext,
    pub action: OperationAction,
}

impl OperationCall {
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.action.kind()
    }
}

/// Performs the side effect for one operation kind.
///
/// Registered with a [`HandlerRouter`](super::HandlerRouter) under the kind it
/// serves. Failures are returned, never panicked; the engine captures them
/// into failed results.
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        action: &OperationAction,
        ctx: &HandlerContext,
    ) -> Result<OperationValue, OperationError>;
}

/// Error for a handler invoked with an action of another kind.
#[must_use]
pub fn wrong_kind(expected: OperationKind, actual: OperationKind) -> OperationError {
    OperationError::new(
        codes::INVALID_PAYLOAD,
        format!("{expected} handler received a {actual} action"),
    )
}

#[cfg(test)]
mod tests {
    use bulkops_core::ComplianceReport;

    use super::*;

    struct MaxTwo;

    impl PolicyCheck for MaxTwo {
        fn check(&self, _entity: &str, assignment: &Assignment) -> ComplianceReport {
            if assignment.assignee_ids.len() > 2 {
                ComplianceReport::rejected(vec!["too many assignees".to_string()])
            } else {
                ComplianceReport::compliant()
            }
        }
    }

    fn assignment(n: usize) -> Assignment {
        Assignment {
            assignee_ids: (0..n).map(|i| format!("coach-{i}")).collect(),
            role: None,
        }
    }

    #[test]
    fn no_policy_means_compliant() {
        let ctx = HandlerContext::new("r1", "op1");
        assert!(ctx.ensure_compliant("plans", &assignment(10)).is_ok());
    }

    #[test]
    fn rejected_assignment_is_policy_violation() {
        let ctx = HandlerContext::new("r1", "op1").with_policy(Some(Arc::new(MaxTwo)));
        assert!(ctx.ensure_compliant("plans", &assignment(2)).is_ok());

        let err = ctx.ensure_compliant("plans", &assignment(3)).unwrap_err();
        assert_eq!(err.code, codes::POLICY_VIOLATION);
        assert_eq!(err.message, "too many assignees");
        assert!(err.suggested_action.is_some());
    }
}
