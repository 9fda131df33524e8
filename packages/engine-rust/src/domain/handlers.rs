//! Reference handlers, one per operation kind, operating on a [`MemoryStore`].
//!
//! Every handler that modifies or removes an existing record returns a
//! before-image so the batch can be undone.

use std::sync::Arc;

use async_trait::async_trait;
use bulkops_core::{
    codes, AssignPayload, Assignment, CreatePayload, DeletePayload, DuplicatePayload,
    OperationAction, OperationError, OperationKind, OperationValue, SchedulePayload,
    TemplatePayload, UpdatePayload,
};
use serde_json::{json, Map, Value};

use super::store::MemoryStore;
use crate::dispatch::{wrong_kind, HandlerContext, OperationHandler};

/// Record field holding the current assignment.
pub const ASSIGNMENT_FIELD: &str = "assignment";
/// Record field holding the current schedule slot.
pub const SCHEDULE_FIELD: &str = "schedule";

// ---------------------------------------------------------------------------
// Macro for the per-kind boilerplate
// ---------------------------------------------------------------------------

/// Generates a handler struct holding the store, and an `OperationHandler`
/// impl that unwraps the matching action variant, consumes injected
/// transient failures, and delegates to the struct's `apply` method.
macro_rules! memory_handler {
    (
        $(#[$meta:meta])*
        $name:ident, $variant:ident, $kind:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            store: Arc<MemoryStore>,
        }

        impl $name {
            #[must_use]
            pub fn new(store: Arc<MemoryStore>) -> Self {
                Self { store }
            }
        }

        #[async_trait]
        impl OperationHandler for $name {
            async fn handle(
                &self,
                action: &OperationAction,
                ctx: &HandlerContext,
            ) -> Result<OperationValue, OperationError> {
                let OperationAction::$variant(payload) = action else {
                    return Err(wrong_kind($kind, action.kind()));
                };
                if let Some(target) = action.target_id() {
                    if self.store.take_transient_failure(action.entity(), target) {
                        return Err(OperationError::new(
                            codes::UNAVAILABLE,
                            format!("{}/{} is temporarily unavailable", action.entity(), target),
                        )
                        .retryable());
                    }
                }
                self.apply(payload, ctx)
            }
        }
    };
}

memory_handler!(
    /// Inserts a record under the given or a generated id.
    CreateHandler, Create, OperationKind::Create
);

memory_handler!(
    /// Merges changes into a record; `null` values remove fields.
    UpdateHandler, Update, OperationKind::Update
);

memory_handler!(
    /// Removes a record.
    DeleteHandler, Delete, OperationKind::Delete
);

memory_handler!(
    /// Replaces a record's assignment after a policy check.
    AssignHandler, Assign, OperationKind::Assign
);

memory_handler!(
    /// Sets a record's schedule slot.
    ScheduleHandler, Schedule, OperationKind::Schedule
);

memory_handler!(
    /// Copies a record under a new id, applying overrides.
    DuplicateHandler, Duplicate, OperationKind::Duplicate
);

memory_handler!(
    /// Instantiates a stored template with variable substitution.
    TemplateHandler, Template, OperationKind::Template
);

// ---------------------------------------------------------------------------
// Per-kind logic
// ---------------------------------------------------------------------------

fn not_found(entity: &str, record_id: &str) -> OperationError {
    OperationError::new(codes::NOT_FOUND, format!("{entity}/{record_id} does not exist"))
        .with_suggestion("check the record id or create the record first")
}

fn expect_object<'a>(value: &'a Value, field: &str) -> Result<&'a Map<String, Value>, OperationError> {
    value.as_object().ok_or_else(|| {
        OperationError::new(codes::INVALID_PAYLOAD, format!("{field} must be a JSON object"))
            .with_field_error(field, "expected an object")
    })
}

impl CreateHandler {
    fn apply(&self, p: &CreatePayload, ctx: &HandlerContext) -> Result<OperationValue, OperationError> {
        let mut record = expect_object(&p.data, "data")?.clone();
        if let Some(assignment) = &p.assignment {
            ctx.ensure_compliant(&p.entity, assignment)?;
            record.insert(ASSIGNMENT_FIELD.to_string(), json!(assignment));
        }
        let record_id = p
            .record_id
            .clone()
            .unwrap_or_else(|| self.store.generate_id(&p.entity));
        let record = Value::Object(record);
        if !self.store.insert_new(&p.entity, &record_id, record.clone()) {
            return Err(OperationError::new(
                codes::CONFLICT,
                format!("{}/{record_id} already exists", p.entity),
            ));
        }
        Ok(OperationValue::new(record_id, record))
    }
}

impl UpdateHandler {
    fn apply(&self, p: &UpdatePayload, _ctx: &HandlerContext) -> Result<OperationValue, OperationError> {
        let changes = expect_object(&p.changes, "changes")?;
        let merged = self.store.modify(&p.entity, &p.record_id, |record| {
            let mut before = Map::new();
            if let Value::Object(fields) = record {
                for (field, value) in changes {
                    let previous = if value.is_null() {
                        fields.remove(field)
                    } else {
                        fields.insert(field.clone(), value.clone())
                    };
                    before.insert(field.clone(), previous.unwrap_or(Value::Null));
                }
            }
            (record.clone(), Value::Object(before))
        });
        let (record, before) = merged.ok_or_else(|| not_found(&p.entity, &p.record_id))?;
        Ok(OperationValue::new(&p.record_id, record).with_before_image(before))
    }
}

impl DeleteHandler {
    fn apply(&self, p: &DeletePayload, _ctx: &HandlerContext) -> Result<OperationValue, OperationError> {
        let removed = self
            .store
            .remove(&p.entity, &p.record_id)
            .ok_or_else(|| not_found(&p.entity, &p.record_id))?;
        Ok(OperationValue::new(&p.record_id, Value::Null).with_before_image(removed))
    }
}

impl AssignHandler {
    fn apply(&self, p: &AssignPayload, ctx: &HandlerContext) -> Result<OperationValue, OperationError> {
        ctx.ensure_compliant(&p.entity, &p.assignment)?;
        let assignment = json!(p.assignment);
        let previous = self.store.modify(&p.entity, &p.record_id, |record| {
            let previous = record
                .get(ASSIGNMENT_FIELD)
                .cloned()
                .unwrap_or_else(|| json!(Assignment::default()));
            if let Value::Object(fields) = record {
                fields.insert(ASSIGNMENT_FIELD.to_string(), assignment.clone());
            }
            previous
        });
        let previous = previous.ok_or_else(|| not_found(&p.entity, &p.record_id))?;
        Ok(OperationValue::new(&p.record_id, assignment).with_before_image(previous))
    }
}

impl ScheduleHandler {
    fn apply(&self, p: &SchedulePayload, _ctx: &HandlerContext) -> Result<OperationValue, OperationError> {
        let slot = json!({ "starts_at": p.starts_at, "ends_at": p.ends_at });
        let previous = self.store.modify(&p.entity, &p.record_id, |record| {
            let previous = record.get(SCHEDULE_FIELD).cloned();
            if let Value::Object(fields) = record {
                fields.insert(SCHEDULE_FIELD.to_string(), slot.clone());
            }
            previous
        });
        let previous = previous.ok_or_else(|| not_found(&p.entity, &p.record_id))?;
        let value = OperationValue::new(&p.record_id, slot);
        // A first-time schedule has no slot to restore.
        Ok(match previous {
            Some(before) => value.with_before_image(before),
            None => value,
        })
    }
}

impl DuplicateHandler {
    fn apply(&self, p: &DuplicatePayload, _ctx: &HandlerContext) -> Result<OperationValue, OperationError> {
        let source = self
            .store
            .get(&p.entity, &p.source_id)
            .ok_or_else(|| not_found(&p.entity, &p.source_id))?;
        let mut copy = expect_object(&source, "source")?.clone();
        if let Some(overrides) = &p.overrides {
            for (field, value) in expect_object(overrides, "overrides")? {
                copy.insert(field.clone(), value.clone());
            }
        }
        let record_id = self.store.generate_id(&p.entity);
        let copy = Value::Object(copy);
        self.store.put(&p.entity, &record_id, copy.clone());
        Ok(OperationValue::new(record_id, copy))
    }
}

impl TemplateHandler {
    fn apply(&self, p: &TemplatePayload, _ctx: &HandlerContext) -> Result<OperationValue, OperationError> {
        let template = self.store.template(&p.template_id).ok_or_else(|| {
            OperationError::new(codes::NOT_FOUND, format!("template {} does not exist", p.template_id))
        })?;
        let record = render(&template, &p.variables);
        expect_object(&record, "template")?;
        let record_id = self.store.generate_id(&p.entity);
        self.store.put(&p.entity, &record_id, record.clone());
        Ok(OperationValue::new(record_id, record))
    }
}

/// Replaces `{{name}}` placeholders in string values. A string that is
/// exactly one placeholder takes the variable's value with its JSON type.
fn render(template: &Value, variables: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix("{{").and_then(|r| r.strip_suffix("}}")) {
                if let Some(value) = variables.get(name.trim()) {
                    return value.clone();
                }
            }
            let mut out = s.clone();
            for (name, value) in variables {
                let text = match value {
                    Value::String(v) => v.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&format!("{{{{{name}}}}}"), &text);
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, variables)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HandlerContext {
        HandlerContext::new("req", "op")
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put("plans", "p1", json!({"title": "Week 1", "level": 2}));
        store
    }

    #[tokio::test]
    async fn create_generates_id_and_rejects_conflicts() {
        let store = seeded();
        let handler = CreateHandler::new(Arc::clone(&store));

        let value = handler
            .handle(
                &OperationAction::Create(CreatePayload {
                    entity: "plans".to_string(),
                    record_id: None,
                    data: json!({"title": "new"}),
                    assignment: None,
                }),
                &ctx(),
            )
            .await
            .unwrap();
        let id = value.record_id.unwrap();
        assert!(store.contains("plans", &id));

        let err = handler
            .handle(
                &OperationAction::Create(CreatePayload {
                    entity: "plans".to_string(),
                    record_id: Some("p1".to_string()),
                    data: json!({}),
                    assignment: None,
                }),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::CONFLICT);
    }

    #[tokio::test]
    async fn update_returns_before_image_of_changed_fields() {
        let store = seeded();
        let handler = UpdateHandler::new(Arc::clone(&store));
        let value = handler
            .handle(
                &OperationAction::Update(UpdatePayload {
                    entity: "plans".to_string(),
                    record_id: "p1".to_string(),
                    changes: json!({"title": "Week 2", "notes": "x", "level": null}),
                }),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(
            value.before_image,
            Some(json!({"title": "Week 1", "notes": null, "level": 2}))
        );
        assert_eq!(store.get("plans", "p1"), Some(json!({"title": "Week 2", "notes": "x"})));
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let handler = UpdateHandler::new(seeded());
        let err = handler
            .handle(
                &OperationAction::Update(UpdatePayload {
                    entity: "plans".to_string(),
                    record_id: "nope".to_string(),
                    changes: json!({"a": 1}),
                }),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_returns_removed_record() {
        let store = seeded();
        let handler = DeleteHandler::new(Arc::clone(&store));
        let value = handler
            .handle(
                &OperationAction::Delete(DeletePayload {
                    entity: "plans".to_string(),
                    record_id: "p1".to_string(),
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(value.before_image.unwrap()["title"], "Week 1");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn assign_captures_previous_assignment() {
        let store = seeded();
        let handler = AssignHandler::new(Arc::clone(&store));
        let value = handler
            .handle(
                &OperationAction::Assign(AssignPayload {
                    entity: "plans".to_string(),
                    record_id: "p1".to_string(),
                    assignment: Assignment {
                        assignee_ids: vec!["c1".to_string()],
                        role: None,
                    },
                }),
                &ctx(),
            )
            .await
            .unwrap();
        let before: Assignment = serde_json::from_value(value.before_image.unwrap()).unwrap();
        assert!(before.assignee_ids.is_empty());
        assert_eq!(store.get("plans", "p1").unwrap()[ASSIGNMENT_FIELD]["assignee_ids"][0], "c1");
    }

    #[tokio::test]
    async fn first_schedule_has_no_before_image() {
        let store = seeded();
        let handler = ScheduleHandler::new(Arc::clone(&store));
        let action = |starts_at| {
            OperationAction::Schedule(SchedulePayload {
                entity: "plans".to_string(),
                record_id: "p1".to_string(),
                starts_at,
                ends_at: None,
            })
        };

        let first = handler.handle(&action(100), &ctx()).await.unwrap();
        assert!(first.before_image.is_none());
        let second = handler.handle(&action(200), &ctx()).await.unwrap();
        assert_eq!(second.before_image.unwrap()["starts_at"], 100);
    }

    #[tokio::test]
    async fn duplicate_applies_overrides() {
        let store = seeded();
        let handler = DuplicateHandler::new(Arc::clone(&store));
        let value = handler
            .handle(
                &OperationAction::Duplicate(DuplicatePayload {
                    entity: "plans".to_string(),
                    source_id: "p1".to_string(),
                    overrides: Some(json!({"title": "Copy"})),
                }),
                &ctx(),
            )
            .await
            .unwrap();
        let copy = store.get("plans", &value.record_id.unwrap()).unwrap();
        assert_eq!(copy, json!({"title": "Copy", "level": 2}));
        assert_eq!(store.count("plans"), 2);
    }

    #[tokio::test]
    async fn template_substitutes_variables() {
        let store = seeded();
        store.define_template("weekly", json!({"title": "{{name}} week", "sessions": "{{count}}"}));
        let handler = TemplateHandler::new(Arc::clone(&store));

        let mut variables = Map::new();
        variables.insert("name".to_string(), json!("Base"));
        variables.insert("count".to_string(), json!(3));
        let value = handler
            .handle(
                &OperationAction::Template(TemplatePayload {
                    entity: "plans".to_string(),
                    template_id: "weekly".to_string(),
                    variables,
                }),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(value.data, json!({"title": "Base week", "sessions": 3}));
    }

    #[tokio::test]
    async fn injected_failure_is_retryable() {
        let store = seeded();
        store.fail_transiently("plans", "p1", 1);
        let handler = DeleteHandler::new(Arc::clone(&store));
        let action = OperationAction::Delete(DeletePayload {
            entity: "plans".to_string(),
            record_id: "p1".to_string(),
        });

        let err = handler.handle(&action, &ctx()).await.unwrap_err();
        assert_eq!(err.code, codes::UNAVAILABLE);
        assert!(err.retryable);
        assert!(handler.handle(&action, &ctx()).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_variant_is_rejected() {
        let handler = DeleteHandler::new(seeded());
        let err = handler
            .handle(
                &OperationAction::Update(UpdatePayload {
                    entity: "plans".to_string(),
                    record_id: "p1".to_string(),
                    changes: json!({}),
                }),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PAYLOAD);
    }
}
