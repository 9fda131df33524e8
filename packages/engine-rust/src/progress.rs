//! Live progress aggregation for one job.
//!
//! Counters are updated under a single mutex, and each snapshot is stored in
//! the job registry and pushed into an unbounded channel while that mutex is
//! held, so observers see snapshots in the order they were computed. A
//! dedicated observer task drains the channel and calls the
//! `ProgressObserver`, keeping observer code off the dispatch path.

use std::sync::Arc;
use std::time::Instant;

use bulkops_core::{ProgressObserver, ProgressSnapshot};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::jobs::JobRegistry;

#[derive(Debug, Default)]
struct Counters {
    completed: usize,
    failed: usize,
    in_flight: usize,
    last_percent: u8,
}

pub struct ProgressTracker {
    request_id: String,
    total: usize,
    started: Instant,
    jobs: Arc<JobRegistry>,
    state: Mutex<TrackerState>,
}

struct TrackerState {
    counters: Counters,
    tx: Option<mpsc::UnboundedSender<ProgressSnapshot>>,
}

/// Handle to the observer task; await it to make sure every snapshot has
/// been delivered.
pub struct ObserverTask(Option<JoinHandle<()>>);

impl ObserverTask {
    pub async fn join(self) {
        if let Some(handle) = self.0 {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "progress observer task failed");
            }
        }
    }
}

impl ProgressTracker {
    /// Creates a tracker and, if an observer is given, spawns the task that
    /// feeds it.
    pub fn start(
        request_id: impl Into<String>,
        total: usize,
        jobs: Arc<JobRegistry>,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> (Self, ObserverTask) {
        let (tx, task) = match observer {
            Some(observer) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<ProgressSnapshot>();
                let handle = tokio::spawn(async move {
                    while let Some(snapshot) = rx.recv().await {
                        observer.on_progress(&snapshot);
                    }
                });
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let tracker = Self {
            request_id: request_id.into(),
            total,
            started: Instant::now(),
            jobs,
            state: Mutex::new(TrackerState {
                counters: Counters::default(),
                tx,
            }),
        };
        (tracker, ObserverTask(task))
    }

    /// An operation acquired a slot and is running. Not published.
    pub fn operation_started(&self) {
        let mut state = self.state.lock();
        state.counters.in_flight += 1;
        let snapshot = self.snapshot(&mut state.counters);
        self.jobs.record_progress(snapshot);
    }

    /// A running operation settled.
    pub fn operation_settled(&self, success: bool) {
        let mut state = self.state.lock();
        let counters = &mut state.counters;
        counters.in_flight = counters.in_flight.saturating_sub(1);
        if success {
            counters.completed += 1;
        } else {
            counters.failed += 1;
        }
        self.publish(&mut state);
    }

    /// Operations that settled as failed without running (skipped,
    /// cancelled, or failed with their chunk).
    pub fn operations_failed_unrun(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.counters.failed += count;
        self.publish(&mut state);
    }

    /// A chunk finished.
    pub fn chunk_settled(&self) {
        let mut state = self.state.lock();
        self.publish(&mut state);
    }

    /// Publishes the final snapshot and closes the observer channel.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        self.publish(&mut state);
        state.tx = None;
    }

    #[must_use]
    pub fn current(&self) -> ProgressSnapshot {
        let mut state = self.state.lock();
        self.snapshot(&mut state.counters)
    }

    fn publish(&self, state: &mut TrackerState) {
        let snapshot = self.snapshot(&mut state.counters);
        let stored = self.jobs.record_progress(snapshot);
        if let Some(tx) = &state.tx {
            // A closed channel only means the observer task is gone.
            let _ = tx.send(stored);
        }
    }

    fn snapshot(&self, counters: &mut Counters) -> ProgressSnapshot {
        let settled = counters.completed + counters.failed;
        let percent = percent_complete(settled, self.total).max(counters.last_percent);
        counters.last_percent = percent;

        ProgressSnapshot {
            request_id: self.request_id.clone(),
            total: self.total,
            completed: counters.completed,
            failed: counters.failed,
            in_flight: counters.in_flight,
            percent_complete: percent,
            eta_ms: self.eta_ms(settled),
            can_cancel: false,
        }
    }

    fn eta_ms(&self, settled: usize) -> Option<u64> {
        if settled == 0 || settled >= self.total {
            return None;
        }
        let elapsed = self.started.elapsed().as_millis();
        let remaining = (self.total - settled) as u128;
        let eta = elapsed * remaining / settled as u128;
        Some(u64::try_from(eta).unwrap_or(u64::MAX))
    }
}

/// `round(settled / total * 100)`, 100 for an empty batch.
#[must_use]
pub fn percent_complete(settled: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let settled = settled.min(total) as u128;
    let rounded = (settled * 200 + total as u128) / (2 * total as u128);
    u8::try_from(rounded).unwrap_or(100)
}
