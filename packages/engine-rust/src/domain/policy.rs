use std::collections::HashSet;

use bulkops_core::{Assignment, ComplianceReport, PolicyCheck};

/// Rule-based compliance check for assignments.
#[derive(Debug, Clone, Default)]
pub struct RulePolicy {
    /// Largest allowed assignee list; `None` for no limit.
    pub max_assignees: Option<usize>,
    pub blocked: HashSet<String>,
}

impl RulePolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_assignees(mut self, max: usize) -> Self {
        self.max_assignees = Some(max);
        self
    }

    #[must_use]
    pub fn block(mut self, assignee_id: impl Into<String>) -> Self {
        self.blocked.insert(assignee_id.into());
        self
    }
}

impl PolicyCheck for RulePolicy {
    fn check(&self, entity: &str, assignment: &Assignment) -> ComplianceReport {
        let mut issues = Vec::new();
        if let Some(max) = self.max_assignees {
            if assignment.assignee_ids.len() > max {
                issues.push(format!(
                    "{entity}: {} assignees exceed the limit of {max}",
                    assignment.assignee_ids.len()
                ));
            }
        }
        for id in &assignment.assignee_ids {
            if self.blocked.contains(id) {
                issues.push(format!("{entity}: assignee {id} is blocked"));
            }
        }
        if issues.is_empty() {
            ComplianceReport::compliant()
        } else {
            ComplianceReport::rejected(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(ids: &[&str]) -> Assignment {
        Assignment {
            assignee_ids: ids.iter().map(ToString::to_string).collect(),
            role: None,
        }
    }

    #[test]
    fn default_policy_allows_everything() {
        assert!(RulePolicy::new().check("plans", &assignment(&["a", "b", "c"])).compliant);
    }

    #[test]
    fn reports_every_violation() {
        let policy = RulePolicy::new().with_max_assignees(1).block("b");
        let report = policy.check("plans", &assignment(&["a", "b"]));
        assert!(!report.compliant);
        assert_eq!(report.issues.len(), 2);
    }
}
