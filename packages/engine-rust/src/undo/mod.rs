//! Undo store: inverse operations retained for a time-boxed rollback window.
//!
//! Inverses are derived from successful results. Creates, duplicates, and
//! template instantiations are undone by deleting the produced record.
//! Deletes, updates, assignments, and schedule changes are undone only when
//! the handler returned a before-image; otherwise the operation is reported
//! as not undoable.

pub mod sweeper;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use bulkops_core::{
    now_millis, AssignPayload, Assignment, BatchOptions, BatchRequest, CreatePayload,
    DeletePayload, Operation, OperationAction, OperationResult, OperationValue, SchedulePayload,
    UpdatePayload,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub use sweeper::UndoSweeper;

/// Prefix of inverse operation ids.
pub const INVERSE_ID_PREFIX: &str = "undo:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseOperation {
    /// Id of the operation this inverse reverts.
    pub operation_id: String,
    pub inverse: Operation,
}

/// Inverses derived from a settled batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UndoPlan {
    pub inverses: Vec<InverseOperation>,
    /// Successful operations without a derivable inverse.
    pub skipped: Vec<String>,
}

impl UndoPlan {
    /// Builds the request that applies the inverses, with default options.
    #[must_use]
    pub fn into_request(self, request_id: impl Into<String>, submitter: &str) -> BatchRequest {
        let operations = self.inverses.into_iter().map(|i| i.inverse).collect();
        BatchRequest::new(request_id, submitter, operations).with_options(BatchOptions::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoContext {
    pub request_id: String,
    pub operations: Vec<InverseOperation>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl UndoContext {
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Builds the request that applies this context's inverses.
    #[must_use]
    pub fn to_request(&self, request_id: impl Into<String>) -> BatchRequest {
        UndoPlan {
            inverses: self.operations.clone(),
            skipped: Vec::new(),
        }
        .into_request(request_id, "undo")
    }

    /// Narrows the context to the inverses that did not succeed in an undo
    /// attempt, so a retry does not re-apply the ones that did.
    ///
    /// Dependencies on inverses that succeeded are dropped. Returns `None`
    /// when nothing is left to undo.
    #[must_use]
    pub fn without_applied(mut self, results: &[OperationResult]) -> Option<UndoContext> {
        let applied: HashSet<&str> = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.operation_id.as_str())
            .collect();
        self.operations
            .retain(|op| !applied.contains(op.inverse.id.as_str()));
        if self.operations.is_empty() {
            return None;
        }
        for op in &mut self.operations {
            op.inverse
                .dependencies
                .retain(|dep| !applied.contains(dep.as_str()));
        }
        Some(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UndoError {
    #[error("no undo context for request {request_id}")]
    NotFound { request_id: String },
    #[error("undo window for request {request_id} closed at {expired_at}")]
    Expired { request_id: String, expired_at: u64 },
    #[error("undo batch for request {request_id} could not run: {source}")]
    Execution {
        request_id: String,
        #[source]
        source: Box<crate::engine::BatchExecutionError>,
    },
}

impl UndoError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            UndoError::NotFound { .. } => "UNDO_NOT_FOUND",
            UndoError::Expired { .. } => "UNDO_EXPIRED",
            UndoError::Execution { .. } => "UNDO_FAILED",
        }
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ScheduleImage {
    starts_at: u64,
    #[serde(default)]
    ends_at: Option<u64>,
}

/// Derives inverses for every successful result.
///
/// Inverses are listed in reverse submission order and their dependencies
/// are reversed: if B depended on A, the inverse of A depends on the inverse
/// of B.
#[must_use]
pub fn derive_inverses(operations: &[Operation], results: &[OperationResult]) -> UndoPlan {
    let by_id: HashMap<&str, &Operation> =
        operations.iter().map(|op| (op.id.as_str(), op)).collect();
    let succeeded: HashMap<&str, &OperationValue> = results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| r.value.as_ref().map(|v| (r.operation_id.as_str(), v)))
        .collect();

    let mut plan = UndoPlan::default();
    let mut inverse_ids: HashMap<&str, String> = HashMap::new();

    for op in operations.iter().rev() {
        let Some(value) = succeeded.get(op.id.as_str()) else {
            continue;
        };
        match inverse_action(&op.action, value) {
            Some(action) => {
                let inverse_id = format!("{INVERSE_ID_PREFIX}{}", op.id);
                inverse_ids.insert(op.id.as_str(), inverse_id.clone());
                plan.inverses.push(InverseOperation {
                    operation_id: op.id.clone(),
                    inverse: Operation::new(inverse_id, action),
                });
            }
            None => {
                tracing::warn!(
                    operation_id = %op.id,
                    kind = %op.kind(),
                    "operation has no derivable inverse; it will not be undone"
                );
                plan.skipped.push(op.id.clone());
            }
        }
    }

    // Reverse the dependency edges among undoable operations.
    let mut extra: HashMap<String, Vec<String>> = HashMap::new();
    for (original_id, dependent_inverse) in &inverse_ids {
        let Some(op) = by_id.get(original_id) else {
            continue;
        };
        for dep in &op.dependencies {
            if let Some(dep_inverse) = inverse_ids.get(dep.as_str()) {
                extra
                    .entry(dep_inverse.clone())
                    .or_default()
                    .push(dependent_inverse.clone());
            }
        }
    }
    for inverse in &mut plan.inverses {
        if let Some(mut deps) = extra.remove(&inverse.inverse.id) {
            deps.sort();
            deps.dedup();
            inverse.inverse.dependencies = deps;
        }
    }

    plan
}

fn inverse_action(action: &OperationAction, value: &OperationValue) -> Option<OperationAction> {
    let before = value.before_image.as_ref().filter(|b| !b.is_null());
    match action {
        OperationAction::Create(p) => {
            let record_id = value.record_id.clone().or_else(|| p.record_id.clone())?;
            Some(delete(&p.entity, record_id))
        }
        OperationAction::Duplicate(p) => Some(delete(&p.entity, value.record_id.clone()?)),
        OperationAction::Template(p) => Some(delete(&p.entity, value.record_id.clone()?)),
        OperationAction::Delete(p) => Some(OperationAction::Create(CreatePayload {
            entity: p.entity.clone(),
            record_id: Some(p.record_id.clone()),
            data: before?.clone(),
            assignment: None,
        })),
        OperationAction::Update(p) => Some(OperationAction::Update(UpdatePayload {
            entity: p.entity.clone(),
            record_id: p.record_id.clone(),
            changes: before?.clone(),
        })),
        OperationAction::Assign(p) => {
            let previous: Assignment = serde_json::from_value(before?.clone()).ok()?;
            Some(OperationAction::Assign(AssignPayload {
                entity: p.entity.clone(),
                record_id: p.record_id.clone(),
                assignment: previous,
            }))
        }
        OperationAction::Schedule(p) => {
            let previous: ScheduleImage = serde_json::from_value(before?.clone()).ok()?;
            Some(OperationAction::Schedule(SchedulePayload {
                entity: p.entity.clone(),
                record_id: p.record_id.clone(),
                starts_at: previous.starts_at,
                ends_at: previous.ends_at,
            }))
        }
    }
}

fn delete(entity: &str, record_id: String) -> OperationAction {
    OperationAction::Delete(DeletePayload {
        entity: entity.to_string(),
        record_id,
    })
}

// ---------------------------------------------------------------------------
// UndoStore
// ---------------------------------------------------------------------------

/// Concurrent map of undo contexts keyed by the original request id.
pub struct UndoStore {
    contexts: DashMap<String, UndoContext>,
    ttl: Duration,
}

impl fmt::Debug for UndoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoStore")
            .field("contexts", &self.contexts.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl UndoStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            contexts: DashMap::new(),
            ttl,
        }
    }

    /// Stores inverses for `request_id`, replacing any earlier context.
    /// Returns the expiry time, or `None` if there was nothing to store.
    pub fn record(&self, request_id: &str, inverses: Vec<InverseOperation>) -> Option<u64> {
        if inverses.is_empty() {
            return None;
        }
        let created_at = now_millis();
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = created_at.saturating_add(ttl_ms);
        let replaced = self.contexts.insert(
            request_id.to_string(),
            UndoContext {
                request_id: request_id.to_string(),
                operations: inverses,
                created_at,
                expires_at,
            },
        );
        if let Some(previous) = replaced {
            tracing::warn!(
                request_id,
                discarded_inverses = previous.operations.len(),
                "request id reused; earlier undo context replaced"
            );
        }
        tracing::debug!(request_id, expires_at, "undo context recorded");
        Some(expires_at)
    }

    /// Removes and returns the context if it is still usable at `now`.
    /// An expired context is removed as well.
    ///
    /// # Errors
    ///
    /// [`UndoError::NotFound`] if there is no context,
    /// [`UndoError::Expired`] if `now >= expires_at`.
    pub fn take_valid(&self, request_id: &str, now: u64) -> Result<UndoContext, UndoError> {
        let (_, context) = self
            .contexts
            .remove(request_id)
            .ok_or_else(|| UndoError::NotFound {
                request_id: request_id.to_string(),
            })?;
        if context.is_expired(now) {
            return Err(UndoError::Expired {
                request_id: request_id.to_string(),
                expired_at: context.expires_at,
            });
        }
        Ok(context)
    }

    /// Puts back a context taken with [`take_valid`](Self::take_valid) whose
    /// undo did not complete.
    pub fn restore(&self, context: UndoContext) {
        self.contexts.insert(context.request_id.clone(), context);
    }

    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<UndoContext> {
        self.contexts.get(request_id).map(|c| c.clone())
    }

    pub fn remove(&self, request_id: &str) -> bool {
        self.contexts.remove(request_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.contexts.contains_key(request_id)
    }

    /// Deletes every context expired at `now`. Returns how many were removed.
    pub fn sweep_expired(&self, now: u64) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|_, context| !context.is_expired(now));
        before.saturating_sub(self.contexts.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
