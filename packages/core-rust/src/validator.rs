//! Pre-flight checks for a batch request.
//!
//! Validation is a pure function of the request: running it twice on the same
//! input yields the same report. Errors block execution when the request asks
//! for validation; warnings are advisory.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resolver::resolve_order;
use crate::result::codes;
use crate::types::{BatchRequest, Operation, OperationAction, OperationKind};

/// Operation count above which a batch is flagged as large.
pub const LARGE_BATCH_THRESHOLD: usize = 1000;

/// Estimated wall time of a single operation.
pub const ESTIMATED_OPERATION_MS: u64 = 100;

/// Estimated memory held per operation while a batch runs.
pub const ESTIMATED_BYTES_PER_OPERATION: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

impl ValidationIssue {
    fn request(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            operation_id: None,
        }
    }

    fn operation(code: &str, operation_id: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            operation_id: Some(operation_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub api_calls: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub estimated_duration_ms: u64,
    pub resource_estimate: ResourceEstimate,
}

impl ValidationReport {
    fn from_issues(errors: Vec<ValidationIssue>, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
            ..Self::default()
        }
    }

    /// Returns true if any error carries `code`.
    #[must_use]
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

/// Validates a typed request.
#[must_use]
pub fn validate(request: &BatchRequest) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let ops = &request.operations;
    let options = &request.options;

    if request.metadata.request_id.trim().is_empty() {
        errors.push(ValidationIssue::request(
            codes::INVALID_REQUEST,
            "request_id must not be empty",
        ));
    }
    if ops.is_empty() {
        warnings.push(ValidationIssue::request(
            codes::INVALID_REQUEST,
            "request contains no operations",
        ));
    }
    if ops.len() > LARGE_BATCH_THRESHOLD {
        warnings.push(ValidationIssue::request(
            "LARGE_BATCH",
            format!(
                "{} operations exceeds the recommended maximum of {LARGE_BATCH_THRESHOLD}",
                ops.len()
            ),
        ));
    }

    check_options(request, &mut errors, &mut warnings);

    let mut seen: HashSet<&str> = HashSet::with_capacity(ops.len());
    for op in ops {
        if op.id.trim().is_empty() {
            errors.push(ValidationIssue::request(
                codes::EMPTY_OPERATION_ID,
                "operation id must not be empty",
            ));
        } else if !seen.insert(op.id.as_str()) {
            errors.push(ValidationIssue::operation(
                codes::DUPLICATE_OPERATION_ID,
                &op.id,
                format!("operation id {} appears more than once", op.id),
            ));
        }
        check_payload(op, &mut errors);
    }

    let ids: HashSet<&str> = ops.iter().map(|op| op.id.as_str()).collect();
    for op in ops {
        let mut declared: HashSet<&str> = HashSet::with_capacity(op.dependencies.len());
        for dep in &op.dependencies {
            if !ids.contains(dep.as_str()) {
                errors.push(ValidationIssue::operation(
                    codes::MISSING_DEPENDENCY,
                    &op.id,
                    format!("{} depends on unknown operation {dep}", op.id),
                ));
            }
            if !declared.insert(dep.as_str()) {
                warnings.push(ValidationIssue::operation(
                    "DUPLICATE_DEPENDENCY",
                    &op.id,
                    format!("{} lists dependency {dep} more than once", op.id),
                ));
            }
        }
    }

    if let Err(err) = resolve_order(ops) {
        errors.push(ValidationIssue::request(err.code(), err.to_string()));
    }

    let count = ops.len() as u64;
    let concurrency = options.effective_concurrency() as u64;
    let mut report = ValidationReport::from_issues(errors, warnings);
    report.estimated_duration_ms = count.div_ceil(concurrency) * ESTIMATED_OPERATION_MS;
    report.resource_estimate = ResourceEstimate {
        api_calls: count,
        memory_bytes: count * ESTIMATED_BYTES_PER_OPERATION,
    };
    report
}

/// Validates a raw JSON request document.
///
/// Reports unknown operation kinds by name before attempting to decode the
/// document, then falls back to [`validate`] on the typed request.
#[must_use]
pub fn validate_json(document: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    if let Some(ops) = document.get("operations").and_then(Value::as_array) {
        for (pos, op) in ops.iter().enumerate() {
            let id = op
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(|| format!("#{pos}"), str::to_string);
            let kind = op
                .get("action")
                .and_then(|a| a.get("type"))
                .and_then(Value::as_str);
            match kind {
                Some(name) if OperationKind::from_name(name).is_some() => {}
                Some(name) => errors.push(ValidationIssue::operation(
                    codes::UNKNOWN_OPERATION_KIND,
                    &id,
                    format!("unknown operation kind {name}"),
                )),
                None => errors.push(ValidationIssue::operation(
                    codes::UNKNOWN_OPERATION_KIND,
                    &id,
                    "operation has no action type",
                )),
            }
        }
    }
    if !errors.is_empty() {
        return ValidationReport::from_issues(errors, Vec::new());
    }

    match serde_json::from_value::<BatchRequest>(document.clone()) {
        Ok(request) => validate(&request),
        Err(err) => ValidationReport::from_issues(
            vec![ValidationIssue::request(codes::INVALID_REQUEST, err.to_string())],
            Vec::new(),
        ),
    }
}

fn check_options(
    request: &BatchRequest,
    errors: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<ValidationIssue>,
) {
    let options = &request.options;
    if options.max_concurrency == 0 {
        errors.push(ValidationIssue::request(
            codes::INVALID_OPTIONS,
            "max_concurrency must be at least 1",
        ));
    }
    if options.chunk_size == 0 {
        errors.push(ValidationIssue::request(
            codes::INVALID_OPTIONS,
            "chunk_size must be at least 1",
        ));
    }
    if options.chunk_size > 0 && options.max_concurrency > options.chunk_size {
        warnings.push(ValidationIssue::request(
            codes::INVALID_OPTIONS,
            format!(
                "max_concurrency {} exceeds chunk_size {}; extra slots stay idle",
                options.max_concurrency, options.chunk_size
            ),
        ));
    }
    if !options.parallel && options.max_concurrency > 1 {
        warnings.push(ValidationIssue::request(
            codes::INVALID_OPTIONS,
            "parallel is disabled; max_concurrency is ignored",
        ));
    }
}

fn check_payload(op: &Operation, errors: &mut Vec<ValidationIssue>) {
    let mut invalid = |message: String| {
        errors.push(ValidationIssue::operation(codes::INVALID_PAYLOAD, &op.id, message));
    };

    if op.action.entity().trim().is_empty() {
        invalid(format!("{} has an empty entity", op.id));
    }
    if let Some(target) = op.action.target_id() {
        if target.trim().is_empty() {
            invalid(format!("{} {} has an empty target id", op.id, op.kind()));
        }
    }
    match &op.action {
        OperationAction::Create(p) if !p.data.is_object() => {
            invalid(format!("{} create data must be an object", op.id));
        }
        OperationAction::Update(p) if !p.changes.is_object() => {
            invalid(format!("{} update changes must be an object", op.id));
        }
        OperationAction::Assign(p)
            if p.assignment.assignee_ids.iter().any(|a| a.trim().is_empty()) =>
        {
            invalid(format!("{} has a blank assignee id", op.id));
        }
        OperationAction::Schedule(p) if p.ends_at.is_some_and(|end| end < p.starts_at) => {
            invalid(format!("{} ends before it starts", op.id));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{
        Assignment, AssignPayload, BatchOptions, CreatePayload, DeletePayload, SchedulePayload,
    };

    fn create(id: &str) -> Operation {
        Operation::new(
            id,
            OperationAction::Create(CreatePayload {
                entity: "plans".to_string(),
                record_id: None,
                data: json!({"title": id}),
                assignment: None,
            }),
        )
    }

    fn request(ops: Vec<Operation>) -> BatchRequest {
        BatchRequest::new("req-1", "tester", ops)
    }

    #[test]
    fn clean_request_is_valid_with_estimates() {
        let report = validate(&request(vec![create("a"), create("b"), create("c")]));
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.resource_estimate.api_calls, 3);
        assert_eq!(report.resource_estimate.memory_bytes, 3 * 1024);
        assert_eq!(report.estimated_duration_ms, 100);
    }

    #[test]
    fn cycle_is_reported_as_circular_dependency() {
        let report = validate(&request(vec![
            create("a").depends_on("b"),
            create("b").depends_on("a"),
        ]));
        assert!(!report.valid);
        assert!(report.has_error("CIRCULAR_DEPENDENCY"));
    }

    #[test]
    fn duplicate_and_missing_ids_are_errors() {
        let report = validate(&request(vec![
            create("a"),
            create("a"),
            create("b").depends_on("zzz"),
        ]));
        assert!(report.has_error(codes::DUPLICATE_OPERATION_ID));
        assert!(report.has_error(codes::MISSING_DEPENDENCY));
    }

    #[test]
    fn payload_problems_are_errors() {
        let ops = vec![
            Operation::new(
                "del",
                OperationAction::Delete(DeletePayload {
                    entity: "plans".to_string(),
                    record_id: String::new(),
                }),
            ),
            Operation::new(
                "assign",
                OperationAction::Assign(AssignPayload {
                    entity: "plans".to_string(),
                    record_id: "p1".to_string(),
                    assignment: Assignment {
                        assignee_ids: vec!["c1".to_string(), " ".to_string()],
                        role: None,
                    },
                }),
            ),
            Operation::new(
                "slot",
                OperationAction::Schedule(SchedulePayload {
                    entity: "sessions".to_string(),
                    record_id: "s1".to_string(),
                    starts_at: 2_000,
                    ends_at: Some(1_000),
                }),
            ),
        ];
        let report = validate(&request(ops));
        let flagged: Vec<_> = report
            .errors
            .iter()
            .filter(|e| e.code == codes::INVALID_PAYLOAD)
            .filter_map(|e| e.operation_id.as_deref())
            .collect();
        assert_eq!(flagged, vec!["del", "assign", "slot"]);
    }

    #[test]
    fn zero_sizes_are_invalid_options() {
        let req = request(vec![create("a")]).with_options(BatchOptions {
            chunk_size: 0,
            max_concurrency: 0,
            ..BatchOptions::default()
        });
        let report = validate(&req);
        assert_eq!(
            report
                .errors
                .iter()
                .filter(|e| e.code == codes::INVALID_OPTIONS)
                .count(),
            2
        );
    }

    #[test]
    fn warnings_do_not_invalidate() {
        let req = request(vec![create("a").depends_on("b").depends_on("b"), create("b")])
            .with_options(BatchOptions {
                max_concurrency: 20,
                chunk_size: 5,
                ..BatchOptions::default()
            });
        let report = validate(&req);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn validation_is_deterministic() {
        let req = request(vec![create("a").depends_on("b"), create("b").depends_on("a")]);
        assert_eq!(validate(&req), validate(&req));
    }

    #[test]
    fn unknown_kind_reported_from_json() {
        let doc = json!({
            "operations": [
                {"id": "a", "action": {"type": "CREATE", "payload": {"entity": "plans", "data": {}}}},
                {"id": "b", "action": {"type": "ARCHIVE", "payload": {}}}
            ],
            "metadata": {"request_id": "r", "submitter": "s", "timestamp": 0}
        });
        let report = validate_json(&doc);
        assert!(!report.valid);
        assert_eq!(report.errors[0].code, codes::UNKNOWN_OPERATION_KIND);
        assert_eq!(report.errors[0].operation_id.as_deref(), Some("b"));
    }

    #[test]
    fn well_formed_json_is_validated_as_typed_request() {
        let doc = json!({
            "operations": [
                {"id": "a", "action": {"type": "CREATE", "payload": {"entity": "plans", "data": {}}}}
            ],
            "metadata": {"request_id": "r", "submitter": "s", "timestamp": 0}
        });
        assert!(validate_json(&doc).valid);
    }
}
