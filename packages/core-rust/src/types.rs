//! Operation, request, and option types submitted to the batch engine.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::traits::{PolicyCheck, ProgressObserver};

/// Default number of operations per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Default number of operations allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Milliseconds since the Unix epoch.
///
/// Clamps to 0 if the system clock reports a time before the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// Tag identifying which handler an operation is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Assign,
    Schedule,
    Duplicate,
    Template,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [OperationKind; 7] = [
        OperationKind::Create,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::Assign,
        OperationKind::Schedule,
        OperationKind::Duplicate,
        OperationKind::Template,
    ];

    /// Wire name of the kind (e.g. `"CREATE"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::Assign => "ASSIGN",
            OperationKind::Schedule => "SCHEDULE",
            OperationKind::Duplicate => "DUPLICATE",
            OperationKind::Template => "TEMPLATE",
        }
    }

    /// Parses a wire name back into a kind.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A set of assignees attached to a record, subject to policy checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignee_ids: Vec<String>,
    /// Optional role the assignees take on (e.g. `"coach"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePayload {
    pub entity: String,
    /// Caller-chosen id. Handlers generate one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub entity: String,
    pub record_id: String,
    /// Fields merged into the existing record.
    pub changes: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub entity: String,
    pub record_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignPayload {
    pub entity: String,
    pub record_id: String,
    pub assignment: Assignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePayload {
    pub entity: String,
    pub record_id: String,
    /// Start of the slot, epoch milliseconds.
    pub starts_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePayload {
    pub entity: String,
    pub source_id: String,
    /// Fields overriding the copied record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatePayload {
    pub entity: String,
    pub template_id: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// OperationAction
// ---------------------------------------------------------------------------

/// What an operation does, one variant per kind with its own typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationAction {
    Create(CreatePayload),
    Update(UpdatePayload),
    Delete(DeletePayload),
    Assign(AssignPayload),
    Schedule(SchedulePayload),
    Duplicate(DuplicatePayload),
    Template(TemplatePayload),
}

impl OperationAction {
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationAction::Create(_) => OperationKind::Create,
            OperationAction::Update(_) => OperationKind::Update,
            OperationAction::Delete(_) => OperationKind::Delete,
            OperationAction::Assign(_) => OperationKind::Assign,
            OperationAction::Schedule(_) => OperationKind::Schedule,
            OperationAction::Duplicate(_) => OperationKind::Duplicate,
            OperationAction::Template(_) => OperationKind::Template,
        }
    }

    /// Collection the action touches.
    #[must_use]
    pub fn entity(&self) -> &str {
        match self {
            OperationAction::Create(p) => &p.entity,
            OperationAction::Update(p) => &p.entity,
            OperationAction::Delete(p) => &p.entity,
            OperationAction::Assign(p) => &p.entity,
            OperationAction::Schedule(p) => &p.entity,
            OperationAction::Duplicate(p) => &p.entity,
            OperationAction::Template(p) => &p.entity,
        }
    }

    /// Id of the existing record the action reads or modifies, if any.
    #[must_use]
    pub fn target_id(&self) -> Option<&str> {
        match self {
            OperationAction::Create(_) => None,
            OperationAction::Update(p) => Some(&p.record_id),
            OperationAction::Delete(p) => Some(&p.record_id),
            OperationAction::Assign(p) => Some(&p.record_id),
            OperationAction::Schedule(p) => Some(&p.record_id),
            OperationAction::Duplicate(p) => Some(&p.source_id),
            OperationAction::Template(p) => Some(&p.template_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Advisory priority carried through to handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// One unit of batch work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique within the owning request.
    pub id: String,
    pub action: OperationAction,
    /// Ids of operations in the same request that must settle first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Operation {
    /// Creates an operation with no dependencies.
    pub fn new(id: impl Into<String>, action: OperationAction) -> Self {
        Self {
            id: id.into(),
            action,
            dependencies: Vec::new(),
            priority: None,
            metadata: None,
        }
    }

    /// Adds a dependency on another operation id.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.action.kind()
    }
}

// ---------------------------------------------------------------------------
// BatchOptions
// ---------------------------------------------------------------------------

/// Execution switches for a batch request.
///
/// The policy check and progress observer are runtime hooks and are never
/// serialized.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// When false, operations run one at a time regardless of `max_concurrency`.
    pub parallel: bool,
    pub max_concurrency: usize,
    /// Skip remaining chunks once any operation has failed.
    pub stop_on_error: bool,
    /// Undo every successful operation when the batch settles with failures.
    pub rollback_on_error: bool,
    pub validate_before_execute: bool,
    pub chunk_size: usize,
    pub notify_on_complete: bool,
    /// Extra attempts for operations failing with a retryable error.
    pub max_retries: u32,
    #[serde(skip)]
    pub policy_check: Option<Arc<dyn PolicyCheck>>,
    #[serde(skip)]
    pub progress_observer: Option<Arc<dyn ProgressObserver>>,
}

impl BatchOptions {
    /// Concurrency actually used for dispatch, never below 1.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        if self.parallel {
            self.max_concurrency.max(1)
        } else {
            1
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            stop_on_error: false,
            rollback_on_error: false,
            validate_before_execute: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            notify_on_complete: false,
            max_retries: 0,
            policy_check: None,
            progress_observer: None,
        }
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("parallel", &self.parallel)
            .field("max_concurrency", &self.max_concurrency)
            .field("stop_on_error", &self.stop_on_error)
            .field("rollback_on_error", &self.rollback_on_error)
            .field("validate_before_execute", &self.validate_before_execute)
            .field("chunk_size", &self.chunk_size)
            .field("notify_on_complete", &self.notify_on_complete)
            .field("max_retries", &self.max_retries)
            .field("policy_check", &self.policy_check.is_some())
            .field("progress_observer", &self.progress_observer.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BatchRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: String,
    pub submitter: String,
    /// Submission time, epoch milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A heterogeneous set of operations submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub options: BatchOptions,
    pub metadata: RequestMetadata,
}

impl BatchRequest {
    /// Creates a request with default options, stamped with the current time.
    pub fn new(
        request_id: impl Into<String>,
        submitter: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            operations,
            options: BatchOptions::default(),
            metadata: RequestMetadata {
                request_id: request_id.into(),
                submitter: submitter.into(),
                timestamp: now_millis(),
                description: None,
            },
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.metadata.request_id
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(OperationKind::from_name("MERGE"), None);
    }

    #[test]
    fn action_serializes_with_type_tag() {
        let op = Operation::new(
            "op-1",
            OperationAction::Delete(DeletePayload {
                entity: "plays".to_string(),
                record_id: "p-9".to_string(),
            }),
        );
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(encoded["action"]["type"], "DELETE");
        assert_eq!(encoded["action"]["payload"]["record_id"], "p-9");
    }

    #[test]
    fn request_parses_with_default_options() {
        let raw = json!({
            "operations": [{
                "id": "a",
                "action": {"type": "CREATE", "payload": {"entity": "plans", "data": {"title": "x"}}}
            }],
            "metadata": {"request_id": "r1", "submitter": "coach", "timestamp": 1}
        });
        let request: BatchRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.operations[0].kind(), OperationKind::Create);
        assert_eq!(request.options.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(request.options.validate_before_execute);
        assert!(request.options.policy_check.is_none());
    }

    #[test]
    fn sequential_options_force_single_slot() {
        let options = BatchOptions {
            parallel: false,
            max_concurrency: 8,
            ..BatchOptions::default()
        };
        assert_eq!(options.effective_concurrency(), 1);

        let zero = BatchOptions {
            max_concurrency: 0,
            ..BatchOptions::default()
        };
        assert_eq!(zero.effective_concurrency(), 1);
    }
}
