//! `BatchEngine`: validates, orders, chunks, and dispatches batch requests.
//!
//! Chunks run one after another. Inside a chunk every operation is spawned as
//! its own task; a task first waits for the in-chunk operations it depends on
//! to settle, then for a limiter slot, then dispatches through the handler
//! pipeline. Cancellation and `stop_on_error` are checked between chunks.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bulkops_core::{
    chunker, codes, now_millis, resolve_order, validate, BatchError, BatchRequest, BatchResponse,
    BatchStatus, BatchSummary, CompletionNotifier, Operation, OperationError, OperationKind,
    OperationResult, PolicyCheck, ProgressSnapshot, ResolveError, RollbackSummary,
    ValidationReport,
};
use futures_util::FutureExt;
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::{info_span, Instrument};

use crate::config::EngineConfig;
use crate::dispatch::{
    build_dispatch_pipeline, ConcurrencyLimiter, DispatchService, HandlerContext, HandlerRouter,
    OperationCall,
};
use crate::jobs::{Job, JobError, JobRegistry, JobStatus};
use crate::progress::ProgressTracker;
use crate::undo::{derive_inverses, UndoError, UndoStore, UndoSweeper};

/// Counter of settled batches, labelled by `status`.
pub const BATCHES_TOTAL: &str = "bulkops_batches_total";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a request is rejected before any operation runs.
#[derive(Debug, thiserror::Error)]
pub enum BatchExecutionError {
    #[error("request {request_id} failed validation with {} error(s)", report.errors.len())]
    Validation {
        request_id: String,
        report: ValidationReport,
    },
    #[error("request {request_id}: {source}")]
    CircularDependency {
        request_id: String,
        #[source]
        source: ResolveError,
    },
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("request {request_id} has {count} operations, above the limit of {limit}")]
    TooLarge {
        request_id: String,
        count: usize,
        limit: usize,
    },
}

impl BatchExecutionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            BatchExecutionError::Validation { .. } => "VALIDATION_FAILED",
            BatchExecutionError::CircularDependency { source, .. } => source.code(),
            BatchExecutionError::Job(err) => err.code(),
            BatchExecutionError::TooLarge { .. } => "REQUEST_TOO_LARGE",
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Completion notifier that logs the settled response.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, response: &BatchResponse) {
        tracing::info!(
            request_id = %response.request_id,
            status = ?response.status,
            successful = response.summary.successful,
            failed = response.summary.failed,
            "batch completion notice"
        );
    }
}

// ---------------------------------------------------------------------------
// BatchEngine
// ---------------------------------------------------------------------------

/// Who submitted a batch. Only client batches leave an undo context behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOrigin {
    Client,
    Undo,
    Rollback,
}

type BatchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<BatchResponse, BatchExecutionError>> + Send + 'a>>;

pub struct BatchEngine {
    config: EngineConfig,
    router: HandlerRouter,
    dispatcher: DispatchService,
    jobs: Arc<JobRegistry>,
    undo: Arc<UndoStore>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("jobs", &self.jobs.len())
            .field("undo_contexts", &self.undo.len())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl BatchEngine {
    #[must_use]
    pub fn new(config: EngineConfig, router: HandlerRouter) -> Self {
        let undo = Arc::new(UndoStore::new(Duration::from_millis(config.undo_ttl_ms)));
        Self {
            dispatcher: build_dispatch_pipeline(router.clone()),
            router,
            config,
            jobs: Arc::new(JobRegistry::new()),
            undo,
            notifier: None,
        }
    }

    /// Sets the notifier called for requests with `notify_on_complete`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    #[must_use]
    pub fn undo_store(&self) -> &Arc<UndoStore> {
        &self.undo
    }

    /// Runs a batch to completion.
    ///
    /// Operation failures never surface here; they are reported per
    /// operation in the response.
    ///
    /// # Errors
    ///
    /// Returns [`BatchExecutionError`] if the request is rejected before
    /// execution: too many operations, failed validation, a dependency
    /// cycle, or a request id whose job is still active.
    pub async fn execute(&self, request: BatchRequest) -> Result<BatchResponse, BatchExecutionError> {
        self.run(request, BatchOrigin::Client).await
    }

    /// Pre-flight check without side effects.
    #[must_use]
    pub fn validate(&self, request: &BatchRequest) -> ValidationReport {
        validate(request)
    }

    /// Requests cooperative cancellation of a running job.
    ///
    /// # Errors
    ///
    /// See [`JobRegistry::cancel`].
    pub fn cancel(&self, request_id: &str) -> Result<(), JobError> {
        self.jobs.cancel(request_id)
    }

    /// Reverts a settled batch by executing its stored inverses.
    ///
    /// The context is removed once the inverse batch completes. If some
    /// inverses fail, only those are put back, so a retry does not re-apply
    /// the ones that already went through.
    ///
    /// # Errors
    ///
    /// [`UndoError::NotFound`], [`UndoError::Expired`], or
    /// [`UndoError::Execution`] if the inverse batch was rejected.
    pub async fn undo(&self, request_id: &str) -> Result<BatchResponse, UndoError> {
        let context = self.undo.take_valid(request_id, now_millis())?;
        let undo_id = format!("{request_id}:undo:{}", uuid::Uuid::new_v4());
        tracing::info!(
            request_id,
            undo_request_id = %undo_id,
            inverses = context.operations.len(),
            "undo started"
        );

        match self.run(context.to_request(undo_id), BatchOrigin::Undo).await {
            Ok(response) => {
                if response.status != BatchStatus::Completed {
                    if let Some(remaining) = context.without_applied(&response.results) {
                        tracing::warn!(
                            request_id,
                            failed = response.summary.failed,
                            remaining = remaining.operations.len(),
                            "undo incomplete; unapplied inverses retained"
                        );
                        self.undo.restore(remaining);
                    }
                }
                Ok(response)
            }
            Err(err) => {
                self.undo.restore(context);
                Err(UndoError::Execution {
                    request_id: request_id.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    #[must_use]
    pub fn get_progress(&self, request_id: &str) -> Option<ProgressSnapshot> {
        self.jobs.progress(request_id)
    }

    #[must_use]
    pub fn get_job(&self, request_id: &str) -> Option<Job> {
        self.jobs.get(request_id)
    }

    /// Starts the background task that evicts expired undo contexts.
    #[must_use]
    pub fn spawn_undo_sweeper(&self) -> UndoSweeper {
        UndoSweeper::start(
            Arc::clone(&self.undo),
            Duration::from_millis(self.config.undo_sweep_interval_ms),
        )
    }

    // -----------------------------------------------------------------------
    // Batch execution
    // -----------------------------------------------------------------------

    fn run_boxed(&self, request: BatchRequest, origin: BatchOrigin) -> BatchFuture<'_> {
        Box::pin(self.run(request, origin))
    }

    async fn run(
        &self,
        request: BatchRequest,
        origin: BatchOrigin,
    ) -> Result<BatchResponse, BatchExecutionError> {
        let span = info_span!(
            "batch",
            request_id = %request.request_id(),
            operations = request.operations.len(),
            origin = ?origin,
        );
        self.run_inner(request, origin).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: BatchRequest,
        origin: BatchOrigin,
    ) -> Result<BatchResponse, BatchExecutionError> {
        let request_id = request.request_id().to_string();
        let total = request.operations.len();

        if total > self.config.max_operations_per_request {
            return Err(BatchExecutionError::TooLarge {
                request_id,
                count: total,
                limit: self.config.max_operations_per_request,
            });
        }

        if request.options.validate_before_execute {
            let report = validate(&request);
            if !report.valid {
                let issues: Vec<&str> = report.errors.iter().map(|e| e.code.as_str()).collect();
                tracing::warn!(?issues, "request rejected by validation");
                return Err(BatchExecutionError::Validation { request_id, report });
            }
        }

        let order = resolve_order(&request.operations).map_err(|source| {
            BatchExecutionError::CircularDependency {
                request_id: request_id.clone(),
                source,
            }
        })?;

        let cancel = self.jobs.register(&request_id, total)?;
        self.jobs.transition(&request_id, JobStatus::Processing);

        let BatchRequest {
            operations,
            options,
            ..
        } = request;
        tracing::info!(
            concurrency = options.effective_concurrency(),
            chunk_size = options.chunk_size,
            "batch started"
        );

        let started = Instant::now();
        let (tracker, observer_task) = ProgressTracker::start(
            request_id.as_str(),
            total,
            Arc::clone(&self.jobs),
            options.progress_observer.clone(),
        );
        let tracker = Arc::new(tracker);
        let limiter = ConcurrencyLimiter::new(options.effective_concurrency());
        // Operations still waiting for a slot when the job is cancelled never
        // start; they settle as CANCELLED.
        let close_on_cancel = {
            let cancel = cancel.clone();
            let limiter = limiter.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                limiter.close();
            })
        };
        let shared = ChunkShared {
            request_id: Arc::from(request_id.as_str()),
            dispatcher: self.dispatcher.clone(),
            limiter: limiter.clone(),
            tracker: Arc::clone(&tracker),
            policy: options.policy_check.clone(),
            max_retries: options.max_retries,
            retry_backoff: Duration::from_millis(self.config.retry_backoff_ms),
        };

        let mut settled: Vec<(usize, OperationResult)> = Vec::with_capacity(total);
        let mut errors = Vec::new();
        let mut cancelled = false;
        let mut halted = false;

        for (chunk_index, chunk) in chunker::chunks(&order, options.chunk_size).enumerate() {
            if !cancelled && cancel.is_cancelled() {
                tracing::info!(chunk_index, "cancellation observed; remaining chunks not started");
                cancelled = true;
            }
            if cancelled || halted {
                let (code, message) = if cancelled {
                    (codes::CANCELLED, "job was cancelled before this operation started")
                } else {
                    (codes::SKIPPED, "skipped after an earlier failure (stop_on_error)")
                };
                settled.extend(chunk.iter().map(|&i| {
                    (i, unrun(&operations[i], OperationError::new(code, message)))
                }));
                tracker.operations_failed_unrun(chunk.len());
                continue;
            }

            let missing: BTreeSet<OperationKind> = chunk
                .iter()
                .map(|&i| operations[i].kind())
                .filter(|kind| !self.router.has_handler(*kind))
                .collect();
            if !missing.is_empty() {
                let kinds: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
                let message = format!(
                    "chunk {chunk_index} failed: no handler registered for {}",
                    kinds.join(", ")
                );
                tracing::warn!(chunk_index, ?kinds, "chunk failed");
                errors.push(BatchError::new(codes::CHUNK_FAILED, message.clone()));
                settled.extend(chunk.iter().map(|&i| {
                    (
                        i,
                        unrun(
                            &operations[i],
                            OperationError::new(codes::CHUNK_FAILED, message.clone()),
                        ),
                    )
                }));
                tracker.operations_failed_unrun(chunk.len());
                halted = options.stop_on_error;
                continue;
            }

            let results = run_chunk(&shared, &operations, chunk).await;
            let chunk_failed = results.iter().any(|(_, r)| !r.is_success());
            settled.extend(results);
            tracker.chunk_settled();

            if chunk_failed && options.stop_on_error {
                tracing::info!(chunk_index, "stop_on_error: remaining chunks skipped");
                halted = true;
            }
        }

        close_on_cancel.abort();

        if !cancelled && cancel.is_cancelled() {
            let unstarted = settled
                .iter()
                .filter(|(_, r)| r.error.as_ref().is_some_and(|e| e.code == codes::CANCELLED))
                .count();
            if unstarted > 0 {
                tracing::info!(unstarted, "cancellation observed during the last chunk");
                cancelled = true;
            } else {
                tracing::info!("cancellation arrived after every operation started; it had no effect");
            }
        }

        settled.sort_by_key(|(i, _)| *i);
        let results: Vec<OperationResult> = settled.into_iter().map(|(_, r)| r).collect();
        let successful = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - successful;
        let status = BatchStatus::from_counts(successful, failed, cancelled);

        #[allow(clippy::cast_precision_loss)]
        let avg_operation_ms = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.duration_ms).sum::<u64>() as f64 / results.len() as f64
        };
        let summary = BatchSummary {
            total,
            successful,
            failed,
            duration_ms: elapsed_ms(started),
            avg_operation_ms,
            peak_concurrency: limiter.peak(),
        };

        let mut response = BatchResponse {
            request_id: request_id.clone(),
            status,
            results,
            summary,
            errors,
            rollback: None,
        };

        if failed > 0 && options.rollback_on_error {
            let (rollback, error) = self.rollback(&request_id, &operations, &response.results).await;
            response.rollback = Some(rollback);
            response.errors.extend(error);
        } else if origin == BatchOrigin::Client && successful > 0 {
            let plan = derive_inverses(&operations, &response.results);
            if let Some(expires_at) = self.undo.record(&request_id, plan.inverses) {
                tracing::debug!(expires_at, not_undoable = plan.skipped.len(), "undo available");
            }
        }

        self.jobs.complete(&response);
        tracker.finish();
        observer_task.join().await;

        metrics::counter!(BATCHES_TOTAL, "status" => status_label(status)).increment(1);
        tracing::info!(
            status = status_label(status),
            successful,
            failed,
            duration_ms = response.summary.duration_ms,
            peak_concurrency = response.summary.peak_concurrency,
            "batch settled"
        );

        if options.notify_on_complete {
            if let Some(notifier) = &self.notifier {
                notifier.notify(&response).await;
            }
        }

        Ok(response)
    }

    /// Executes the inverses of every successful result right away.
    async fn rollback(
        &self,
        request_id: &str,
        operations: &[Operation],
        results: &[OperationResult],
    ) -> (RollbackSummary, Option<BatchError>) {
        let plan = derive_inverses(operations, results);
        let attempted = plan.inverses.len();
        let skipped = plan.skipped.len();
        if attempted == 0 {
            return (
                RollbackSummary {
                    status: BatchStatus::Completed,
                    attempted,
                    reverted: 0,
                    skipped,
                },
                None,
            );
        }

        tracing::info!(attempted, skipped, "rolling back successful operations");
        let rollback_id = format!("{request_id}:rollback");
        match self
            .run_boxed(plan.into_request(rollback_id, "rollback"), BatchOrigin::Rollback)
            .await
        {
            Ok(response) => {
                let summary = RollbackSummary {
                    status: response.status,
                    attempted,
                    reverted: response.summary.successful,
                    skipped,
                };
                let error = (response.status != BatchStatus::Completed).then(|| {
                    BatchError::new(
                        codes::ROLLBACK_FAILED,
                        format!(
                            "{} of {attempted} inverse operations failed",
                            response.summary.failed
                        ),
                    )
                });
                (summary, error)
            }
            Err(err) => {
                tracing::error!(error = %err, "rollback batch rejected");
                (
                    RollbackSummary {
                        status: BatchStatus::Failed,
                        attempted,
                        reverted: 0,
                        skipped,
                    },
                    Some(BatchError::new(codes::ROLLBACK_FAILED, err.to_string())),
                )
            }
        }
    }
}

fn status_label(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Completed => "completed",
        BatchStatus::Partial => "partial",
        BatchStatus::Failed => "failed",
        BatchStatus::Cancelled => "cancelled",
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn unrun(op: &Operation, error: OperationError) -> OperationResult {
    OperationResult::failure(op.id.clone(), op.kind(), error, 0, 0)
}

// ---------------------------------------------------------------------------
// Chunk execution
// ---------------------------------------------------------------------------

/// Per-batch state shared by every operation task.
#[derive(Clone)]
struct ChunkShared {
    request_id: Arc<str>,
    dispatcher: DispatchService,
    limiter: ConcurrencyLimiter,
    tracker: Arc<ProgressTracker>,
    policy: Option<Arc<dyn PolicyCheck>>,
    max_retries: u32,
    retry_backoff: Duration,
}

/// Spawns one task per operation in the chunk and waits for all of them.
/// Returns `(submission index, result)` pairs.
async fn run_chunk(
    shared: &ChunkShared,
    operations: &[Operation],
    chunk: &[usize],
) -> Vec<(usize, OperationResult)> {
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(chunk.len());
    let mut settled_rx = Vec::with_capacity(chunk.len());
    let mut settled_tx = Vec::with_capacity(chunk.len());
    for (pos, &i) in chunk.iter().enumerate() {
        position.entry(operations[i].id.as_str()).or_insert(pos);
        let (tx, rx) = watch::channel(false);
        settled_tx.push(tx);
        settled_rx.push(rx);
    }

    let mut handles = Vec::with_capacity(chunk.len());
    for ((pos, &i), done) in chunk.iter().enumerate().zip(settled_tx) {
        let op = operations[i].clone();
        // Resolved order puts prerequisites first, so only earlier positions
        // can be waited on.
        let prerequisites: Vec<watch::Receiver<bool>> = op
            .dependencies
            .iter()
            .filter_map(|dep| position.get(dep.as_str()))
            .filter(|&&p| p < pos)
            .map(|&p| settled_rx[p].clone())
            .collect();
        let task = OperationTask {
            shared: shared.clone(),
            op,
        };
        handles.push((i, tokio::spawn(task.run(prerequisites, done))));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (i, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(operation_id = %operations[i].id, error = %err, "operation task aborted");
                shared.tracker.operation_settled(false);
                unrun(
                    &operations[i],
                    OperationError::new(codes::HANDLER_PANICKED, err.to_string()),
                )
            }
        };
        results.push((i, result));
    }
    results
}

struct OperationTask {
    shared: ChunkShared,
    op: Operation,
}

impl OperationTask {
    async fn run(
        self,
        prerequisites: Vec<watch::Receiver<bool>>,
        done: watch::Sender<bool>,
    ) -> OperationResult {
        for mut rx in prerequisites {
            // A dropped sender also means the prerequisite is finished.
            let _ = rx.wait_for(|settled| *settled).await;
        }
        let result = self.dispatch().await;
        done.send_replace(true);
        result
    }

    async fn dispatch(&self) -> OperationResult {
        let shared = &self.shared;
        let Ok(permit) = shared.limiter.acquire().await else {
            shared.tracker.operations_failed_unrun(1);
            return unrun(
                &self.op,
                OperationError::new(
                    codes::CANCELLED,
                    "job was cancelled before this operation started",
                ),
            );
        };
        shared.tracker.operation_started();

        let started = Instant::now();
        let mut attempt = 0;
        let outcome = loop {
            let call = OperationCall {
                ctx: HandlerContext {
                    request_id: Arc::clone(&shared.request_id),
                    operation_id: self.op.id.clone(),
                    attempt,
                    priority: self.op.priority.unwrap_or_default(),
                    policy: shared.policy.clone(),
                },
                action: self.op.action.clone(),
            };
            let outcome = match AssertUnwindSafe(shared.dispatcher.clone().oneshot(call))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(OperationError::new(
                    codes::HANDLER_PANICKED,
                    panic_message(&*panic),
                )),
            };
            match outcome {
                Err(err) if err.retryable && attempt < shared.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        operation_id = %self.op.id,
                        attempt,
                        code = %err.code,
                        "retrying operation"
                    );
                    tokio::time::sleep(shared.retry_backoff * attempt).await;
                }
                other => break other,
            }
        };
        drop(permit);

        let duration_ms = elapsed_ms(started);
        let result = match outcome {
            Ok(value) => {
                OperationResult::success(self.op.id.clone(), self.op.kind(), value, duration_ms, attempt)
            }
            Err(err) => {
                tracing::warn!(
                    operation_id = %self.op.id,
                    kind = %self.op.kind(),
                    code = %err.code,
                    message = %err.message,
                    "operation failed"
                );
                OperationResult::failure(self.op.id.clone(), self.op.kind(), err, duration_ms, attempt)
            }
        };
        shared.tracker.operation_settled(result.is_success());
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
