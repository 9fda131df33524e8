//! Periodic eviction of expired undo contexts.

use std::sync::Arc;
use std::time::Duration;

use bulkops_core::now_millis;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::UndoStore;

/// Handle to the spawned sweep loop. Dropping it without calling
/// [`stop`](Self::stop) leaves the loop running until the runtime shuts down.
#[derive(Debug)]
pub struct UndoSweeper {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl UndoSweeper {
    /// Spawns a task that sweeps `store` every `interval`.
    #[must_use]
    pub fn start(store: Arc<UndoStore>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = ticks.tick() => sweep(&store),
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!(remaining = store.len(), "undo sweeper stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the loop to exit and waits for it. Calling it twice is a no-op.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn sweep(store: &UndoStore) {
    let removed = store.sweep_expired(now_millis());
    if removed > 0 {
        tracing::info!(removed, remaining = store.len(), "expired undo contexts swept");
    }
}
