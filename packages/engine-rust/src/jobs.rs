//! Job registry: lifecycle state and cancellation switch per request.
//!
//! State machine: Queued -> Processing -> {Completed | Failed | Cancelled}.
//! Transitions only move forward; a terminal job never changes status again.

use std::fmt;

use bulkops_core::{now_millis, BatchResponse, BatchStatus, ProgressSnapshot};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    /// Stopped between chunks after `cancel` was called.
    Cancelled,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BatchStatus> for JobStatus {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed | BatchStatus::Partial => JobStatus::Completed,
            BatchStatus::Failed => JobStatus::Failed,
            BatchStatus::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("no job for request {request_id}")]
    NotFound { request_id: String },
    #[error("job for request {request_id} is {status} and can no longer be cancelled")]
    NotCancellable { request_id: String, status: JobStatus },
    #[error("request {request_id} is already being processed")]
    DuplicateRequest { request_id: String },
}

impl JobError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            JobError::NotFound { .. } => "JOB_NOT_FOUND",
            JobError::NotCancellable { .. } => "JOB_NOT_CANCELLABLE",
            JobError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
        }
    }
}

/// Runtime record of one submitted request.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub request_id: String,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub result: Option<BatchResponse>,
    pub error: Option<String>,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

/// Concurrent map of jobs keyed by request id.
///
/// Each entry is locked independently, so progress updates for one job never
/// contend with another job's.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, JobEntry>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queued job and returns its cancellation token.
    ///
    /// A request id may be reused once its previous job is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::DuplicateRequest`] while a job with the same
    /// request id is still queued or processing.
    pub fn register(&self, request_id: &str, total: usize) -> Result<CancellationToken, JobError> {
        let cancel = CancellationToken::new();
        let entry = JobEntry {
            job: Job {
                job_id: uuid::Uuid::new_v4().to_string(),
                request_id: request_id.to_string(),
                status: JobStatus::Queued,
                progress: ProgressSnapshot {
                    request_id: request_id.to_string(),
                    total,
                    completed: 0,
                    failed: 0,
                    in_flight: 0,
                    percent_complete: if total == 0 { 100 } else { 0 },
                    eta_ms: None,
                    can_cancel: false,
                },
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
            },
            cancel: cancel.clone(),
        };

        match self.jobs.entry(request_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().job.status.is_terminal() {
                    return Err(JobError::DuplicateRequest {
                        request_id: request_id.to_string(),
                    });
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(cancel)
    }

    /// Moves a job forward. Returns false if the job is unknown or the
    /// transition would move backwards or out of a terminal state.
    pub fn transition(&self, request_id: &str, to: JobStatus) -> bool {
        let Some(mut entry) = self.jobs.get_mut(request_id) else {
            return false;
        };
        let job = &mut entry.job;
        if job.status.is_terminal() || to.rank() <= job.status.rank() {
            return false;
        }
        job.status = to;
        match to {
            JobStatus::Processing => {
                job.started_at = Some(now_millis());
                job.progress.can_cancel = true;
            }
            _ if to.is_terminal() => {
                job.completed_at = Some(now_millis());
                job.progress.can_cancel = false;
            }
            _ => {}
        }
        true
    }

    /// Stores the latest progress snapshot, stamping `can_cancel` from the
    /// job's current status. Returns the stored snapshot.
    pub fn record_progress(&self, mut snapshot: ProgressSnapshot) -> ProgressSnapshot {
        if let Some(mut entry) = self.jobs.get_mut(&snapshot.request_id) {
            snapshot.can_cancel = entry.job.status == JobStatus::Processing;
            entry.job.progress = snapshot.clone();
        }
        snapshot
    }

    /// Marks the job terminal with its settled response.
    pub fn complete(&self, response: &BatchResponse) {
        let status = JobStatus::from(response.status);
        if !self.transition(&response.request_id, status) {
            tracing::warn!(
                request_id = %response.request_id,
                status = %status,
                "job already terminal; keeping the first outcome"
            );
            return;
        }
        if let Some(mut entry) = self.jobs.get_mut(&response.request_id) {
            entry.job.error = match response.status {
                BatchStatus::Failed => Some(format!(
                    "{} of {} operations failed",
                    response.summary.failed, response.summary.total
                )),
                BatchStatus::Cancelled => Some("cancelled by request".to_string()),
                BatchStatus::Completed | BatchStatus::Partial => None,
            };
            entry.job.result = Some(response.clone());
        }
    }

    /// Requests cooperative cancellation. Chunks not yet started are skipped,
    /// as are operations of the running chunk still waiting for a slot.
    /// Operations already dispatched run to completion.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] for an unknown request id,
    /// [`JobError::NotCancellable`] for a terminal job.
    pub fn cancel(&self, request_id: &str) -> Result<(), JobError> {
        let entry = self.jobs.get(request_id).ok_or_else(|| JobError::NotFound {
            request_id: request_id.to_string(),
        })?;
        if entry.job.status.is_terminal() {
            return Err(JobError::NotCancellable {
                request_id: request_id.to_string(),
                status: entry.job.status,
            });
        }
        entry.cancel.cancel();
        tracing::info!(request_id, "cancellation requested");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, request_id: &str) -> Option<Job> {
        self.jobs.get(request_id).map(|entry| entry.job.clone())
    }

    #[must_use]
    pub fn status(&self, request_id: &str) -> Option<JobStatus> {
        self.jobs.get(request_id).map(|entry| entry.job.status)
    }

    #[must_use]
    pub fn progress(&self, request_id: &str) -> Option<ProgressSnapshot> {
        self.jobs.get(request_id).map(|entry| entry.job.progress.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bulkops_core::BatchSummary;

    use super::*;

    fn response(request_id: &str, status: BatchStatus) -> BatchResponse {
        BatchResponse {
            request_id: request_id.to_string(),
            status,
            results: Vec::new(),
            summary: BatchSummary {
                total: 2,
                failed: 2,
                ..BatchSummary::default()
            },
            errors: Vec::new(),
            rollback: None,
        }
    }

    #[test]
    fn register_starts_queued() {
        let jobs = JobRegistry::new();
        jobs.register("r1", 4).unwrap();
        let job = jobs.get("r1").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress.total, 4);
        assert!(!job.progress.can_cancel);
    }

    #[test]
    fn transitions_only_move_forward() {
        let jobs = JobRegistry::new();
        jobs.register("r1", 1).unwrap();

        assert!(jobs.transition("r1", JobStatus::Processing));
        assert!(jobs.get("r1").unwrap().started_at.is_some());
        assert!(!jobs.transition("r1", JobStatus::Queued));
        assert!(jobs.transition("r1", JobStatus::Completed));
        assert!(!jobs.transition("r1", JobStatus::Failed));
        assert_eq!(jobs.status("r1"), Some(JobStatus::Completed));
        assert!(!jobs.transition("missing", JobStatus::Processing));
    }

    #[test]
    fn duplicate_active_request_is_rejected() {
        let jobs = JobRegistry::new();
        jobs.register("r1", 1).unwrap();
        let err = jobs.register("r1", 1).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_REQUEST");

        jobs.transition("r1", JobStatus::Processing);
        jobs.complete(&response("r1", BatchStatus::Completed));
        assert!(jobs.register("r1", 3).is_ok());
        assert_eq!(jobs.status("r1"), Some(JobStatus::Queued));
    }

    #[test]
    fn cancel_sets_token_and_rejects_terminal_jobs() {
        let jobs = JobRegistry::new();
        let token = jobs.register("r1", 1).unwrap();
        jobs.transition("r1", JobStatus::Processing);

        jobs.cancel("r1").unwrap();
        assert!(token.is_cancelled());

        jobs.complete(&response("r1", BatchStatus::Cancelled));
        let err = jobs.cancel("r1").unwrap_err();
        assert!(matches!(
            err,
            JobError::NotCancellable { status: JobStatus::Cancelled, .. }
        ));
        assert_eq!(
            jobs.cancel("nope").unwrap_err().code(),
            "JOB_NOT_FOUND"
        );
    }

    #[test]
    fn complete_maps_batch_status() {
        let jobs = JobRegistry::new();
        jobs.register("r1", 2).unwrap();
        jobs.transition("r1", JobStatus::Processing);
        jobs.complete(&response("r1", BatchStatus::Failed));

        let job = jobs.get("r1").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("2 of 2 operations failed"));
        assert!(job.result.is_some());
        assert!(job.completed_at.is_some());

        assert_eq!(JobStatus::from(BatchStatus::Partial), JobStatus::Completed);
    }

    #[test]
    fn progress_can_cancel_follows_status() {
        let jobs = JobRegistry::new();
        jobs.register("r1", 2).unwrap();
        jobs.transition("r1", JobStatus::Processing);

        let mut snapshot = jobs.progress("r1").unwrap();
        snapshot.completed = 1;
        snapshot.percent_complete = 50;
        let stored = jobs.record_progress(snapshot);
        assert!(stored.can_cancel);
        assert_eq!(jobs.progress("r1").unwrap().percent_complete, 50);

        jobs.transition("r1", JobStatus::Completed);
        let stored = jobs.record_progress(jobs.progress("r1").unwrap());
        assert!(!stored.can_cancel);
    }
}
