//! Debounced change observer.
//!
//! Watches local mutation signals and requests one sync per edit burst:
//! the first change arms a quiet-period timer, every further change resets
//! it, and only expiry sends a request. Requests collapse into a
//! capacity-1 channel so an already-queued sync absorbs new triggers.

use crate::sync::scheduler::SyncRequest;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Watches for local mutation bursts and requests syncs after a quiet
/// period. Spawn only when the sync-on-change policy is enabled.
pub struct ChangeObserver {
    changes_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl ChangeObserver {
    /// Spawn the observer task. `debounce` is the quiet period; sync
    /// requests go out through `requests`.
    pub fn spawn(debounce: Duration, requests: mpsc::Sender<SyncRequest>) -> Self {
        let (changes_tx, mut changes_rx) = mpsc::unbounded_channel::<()>();

        let task = tokio::spawn(async move {
            while changes_rx.recv().await.is_some() {
                // Burst started: keep extending the quiet period until no
                // change arrives for a full debounce window
                loop {
                    match tokio::time::timeout(debounce, changes_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                match requests.try_send(SyncRequest::ChangeTriggered) {
                    Ok(()) => debug!("change burst settled, sync requested"),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("sync already queued, trigger absorbed")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        });

        Self { changes_tx, task }
    }

    /// Record one local mutation. Cheap and non-blocking; call from any
    /// write path of a watched collection.
    pub fn notify(&self) {
        let _ = self.changes_tx.send(());
    }
}

impl Drop for ChangeObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
