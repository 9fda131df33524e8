use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::result::{BatchResponse, ProgressSnapshot};
use crate::types::Assignment;

/// Receives progress snapshots while a batch runs.
///
/// Invoked from a dedicated observer task, one snapshot at a time and in
/// publication order. Implementations must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self(snapshot);
    }
}

/// Result of a compliance check on an assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl ComplianceReport {
    #[must_use]
    pub fn compliant() -> Self {
        Self {
            compliant: true,
            issues: Vec::new(),
        }
    }

    #[must_use]
    pub fn rejected(issues: Vec<String>) -> Self {
        Self {
            compliant: false,
            issues,
        }
    }
}

/// Policy hook consulted by handlers before assigning people to a record.
pub trait PolicyCheck: Send + Sync {
    fn check(&self, entity: &str, assignment: &Assignment) -> ComplianceReport;
}

/// Told about every settled batch whose options request a notification.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, response: &BatchResponse);
}
