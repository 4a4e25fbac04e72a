//! Callback fan-out with per-listener fault isolation.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Handle returned by listener registration, used for removal.
pub type ListenerId = Uuid;

type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// An ordered set of callbacks for one notification kind.
///
/// A listener that returns an error is logged and skipped; the remaining
/// listeners still run. From the delivery counters' point of view a failed
/// listener call is one dropped delivery.
pub struct Listeners<T> {
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
    label: &'static str,
}

impl<T> Listeners<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            label,
        }
    }

    pub async fn add<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.entries.lock().await.push((id, Arc::new(callback)));
        id
    }

    /// Remove one listener. Returns false when the id is unknown.
    pub async fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Invoke every listener in registration order.
    ///
    /// Returns the number of listeners that failed.
    pub async fn notify(&self, value: &T) -> u64 {
        let callbacks: Vec<Callback<T>> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        let mut failures = 0;
        for callback in callbacks {
            if let Err(e) = callback(value) {
                warn!(listener = self.label, error = %e, "listener failed");
                failures += 1;
            }
        }
        failures
    }
}
