//! Outcome types: per-operation results, batch responses, progress snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::OperationKind;

/// Well-known error codes attached to operation and batch errors.
pub mod codes {
    pub const CIRCULAR_DEPENDENCY: &str = "CIRCULAR_DEPENDENCY";
    pub const MISSING_DEPENDENCY: &str = "MISSING_DEPENDENCY";
    pub const DUPLICATE_OPERATION_ID: &str = "DUPLICATE_OPERATION_ID";
    pub const EMPTY_OPERATION_ID: &str = "EMPTY_OPERATION_ID";
    pub const UNKNOWN_OPERATION_KIND: &str = "UNKNOWN_OPERATION_KIND";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const INVALID_OPTIONS: &str = "INVALID_OPTIONS";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const POLICY_VIOLATION: &str = "POLICY_VIOLATION";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    /// Transient failure; usually flagged retryable.
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const SKIPPED: &str = "SKIPPED";
    pub const CANCELLED: &str = "CANCELLED";
    pub const CHUNK_FAILED: &str = "CHUNK_FAILED";
    pub const HANDLER_PANICKED: &str = "HANDLER_PANICKED";
    pub const NO_HANDLER: &str = "NO_HANDLER";
    pub const ROLLBACK_FAILED: &str = "ROLLBACK_FAILED";
}

// ---------------------------------------------------------------------------
// OperationValue / OperationError
// ---------------------------------------------------------------------------

/// Value a handler produces for a successful operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationValue {
    /// Id of the record created or modified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// State of the record before the side effect. Required to undo
    /// updates, deletes, assignments, and schedule changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_image: Option<Value>,
}

impl OperationValue {
    pub fn new(record_id: impl Into<String>, data: Value) -> Self {
        Self {
            record_id: Some(record_id.into()),
            data,
            before_image: None,
        }
    }

    #[must_use]
    pub fn with_before_image(mut self, before: Value) -> Self {
        self.before_image = Some(before);
        self
    }
}

/// Field-level validation failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Per-operation failure. Captured into a failed result, never thrown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct OperationError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
    /// Whether re-dispatching the operation may succeed.
    #[serde(default)]
    pub retryable: bool,
}

impl OperationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            suggested_action: None,
            field_errors: Vec::new(),
            retryable: false,
        }
    }

    #[must_use]
    pub fn with_suggestion(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_field_error(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.field_errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
        self
    }

    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

// ---------------------------------------------------------------------------
// OperationResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
}

/// Settled outcome of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<OperationValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub duration_ms: u64,
    pub retry_count: u32,
    /// Settlement time, epoch milliseconds.
    pub settled_at: u64,
}

impl OperationResult {
    #[must_use]
    pub fn success(
        operation_id: String,
        kind: OperationKind,
        value: OperationValue,
        duration_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::Success,
            value: Some(value),
            error: None,
            duration_ms,
            retry_count,
            settled_at: crate::types::now_millis(),
        }
    }

    #[must_use]
    pub fn failure(
        operation_id: String,
        kind: OperationKind,
        error: OperationError,
        duration_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::Failed,
            value: None,
            error: Some(error),
            duration_ms,
            retry_count,
            settled_at: crate::types::now_millis(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

// ---------------------------------------------------------------------------
// BatchResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Every operation succeeded.
    Completed,
    /// Some operations succeeded and some failed.
    Partial,
    /// No operation succeeded.
    Failed,
    /// The job was cancelled before all chunks ran.
    Cancelled,
}

impl BatchStatus {
    /// Derives the batch status from settled counts.
    #[must_use]
    pub fn from_counts(successful: usize, failed: usize, cancelled: bool) -> Self {
        if cancelled {
            BatchStatus::Cancelled
        } else if failed == 0 {
            BatchStatus::Completed
        } else if successful == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub avg_operation_ms: f64,
    pub peak_concurrency: usize,
}

/// Engine-level problem, as opposed to an operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
}

impl BatchError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Outcome of the automatic rollback triggered by `rollback_on_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSummary {
    pub status: BatchStatus,
    /// Inverse operations executed.
    pub attempted: usize,
    pub reverted: usize,
    /// Successful operations with no derivable inverse.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub request_id: String,
    pub status: BatchStatus,
    pub results: Vec<OperationResult>,
    pub summary: BatchSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BatchError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSummary>,
}

impl BatchResponse {
    /// Looks up the result for an operation id.
    #[must_use]
    pub fn result(&self, operation_id: &str) -> Option<&OperationResult> {
        self.results.iter().find(|r| r.operation_id == operation_id)
    }
}

// ---------------------------------------------------------------------------
// ProgressSnapshot
// ---------------------------------------------------------------------------

/// Immutable view of a job's progress at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub request_id: String,
    pub total: usize,
    /// Operations settled successfully.
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub percent_complete: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    pub can_cancel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_from_counts() {
        assert_eq!(BatchStatus::from_counts(3, 0, false), BatchStatus::Completed);
        assert_eq!(BatchStatus::from_counts(2, 1, false), BatchStatus::Partial);
        assert_eq!(BatchStatus::from_counts(0, 4, false), BatchStatus::Failed);
        assert_eq!(BatchStatus::from_counts(2, 1, true), BatchStatus::Cancelled);
        assert_eq!(BatchStatus::from_counts(0, 0, false), BatchStatus::Completed);
    }

    #[test]
    fn operation_error_display_includes_code() {
        let err = OperationError::new(codes::NOT_FOUND, "record p-1 missing")
            .with_suggestion("refresh the list")
            .with_field_error("record_id", "unknown id");
        assert_eq!(err.to_string(), "NOT_FOUND: record p-1 missing");
        assert_eq!(err.field_errors.len(), 1);
        assert!(!err.retryable);
    }
}
