use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::DurableStore;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

struct PendingWrite {
    document: Value,
    scheduled_at: DateTime<Utc>,
    timer: JoinHandle<()>,
}

/// Per-key debounce layer above the [`DurableStore`].
///
/// Rapid writes to the same key (window drags, terminal output) collapse
/// into a single disk write carrying the last document; intermediate
/// versions are dropped by design. This is a coalescing cache, not a log.
///
/// `flush_all` is mandatory on the shutdown path: any key with a live timer
/// still holds its most recent mutation in memory only.
pub struct WriteCoalescer {
    store: Arc<DurableStore>,
    debounce: Duration,
    pending: Arc<Mutex<HashMap<String, PendingWrite>>>,
}

impl WriteCoalescer {
    pub fn new(store: Arc<DurableStore>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    /// Schedule a write of `document` under `key` after the debounce delay.
    /// A second call for the same key before the timer fires replaces the
    /// pending document and resets the delay.
    pub async fn write_debounced(&self, key: &str, document: Value) {
        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.remove(key) {
            previous.timer.abort();
        }

        let timer = tokio::spawn({
            let store = self.store.clone();
            let pending = self.pending.clone();
            let key = key.to_string();
            let delay = self.debounce;
            async move {
                tokio::time::sleep(delay).await;
                // Take the entry back out of the map. If a flush or a newer
                // debounced write got there first, there is nothing to do.
                let entry = {
                    let mut pending = pending.lock().await;
                    pending.remove(&key)
                };
                if let Some(entry) = entry {
                    if let Err(e) = store.write(&key, &entry.document).await {
                        warn!("Debounced write for '{}' failed: {}", key, e);
                    }
                }
            }
        });

        pending.insert(
            key.to_string(),
            PendingWrite {
                document,
                scheduled_at: Utc::now(),
                timer,
            },
        );
    }

    /// Cancel every pending timer and perform the writes immediately.
    /// Returns once all underlying writes complete; the first failure is
    /// reported after the remaining writes have still been attempted.
    pub async fn flush_all(&self) -> crate::Result<()> {
        let drained: Vec<(String, PendingWrite)> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };

        let mut first_error = None;
        for (key, entry) in drained {
            entry.timer.abort();
            debug!(
                "Flushing pending write for '{}' (scheduled at {})",
                key, entry.scheduled_at
            );
            if let Err(e) = self.store.write(&key, &entry.document).await {
                warn!("Flush of '{}' failed: {}", key, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
