//! Debounced background persistence.
//!
//! Rather than rewriting both state files on every turn, [`Autosave`] wakes up once per
//! interval and saves only when the store changed since the last successful save. The
//! save itself runs on tokio's blocking pool. [`Autosave::shutdown`] stops the loop and
//! flushes any remaining changes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::memory_store::MemoryStore;

/// Handle to a running autosave task.
pub struct Autosave {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

async fn save_if_dirty(store: &Arc<MemoryStore>) {
    if !store.is_dirty() {
        return;
    }
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || store.save()).await {
        Ok(Ok(())) => debug!("Autosave complete"),
        // Already logged by MemoryStore::save; retried on the next tick.
        Ok(Err(_)) => {}
        Err(e) => error!(error = %e, "Autosave task panicked"),
    }
}

impl Autosave {
    /// Start saving `store` every `interval` while it is dirty.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<MemoryStore>, interval: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let period = interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "Autosave started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => save_if_dirty(&store).await,
                    _ = &mut stopped => break,
                }
            }

            save_if_dirty(&store).await;
            info!("Autosave stopped");
        });

        Self { stop, handle }
    }

    /// Stop the task after a final save.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            error!(error = %e, "Autosave task failed");
        }
    }
}
