//! Coalescing update buffer.
//!
//! Incoming samples are upserted into a private staging map. A fixed-interval
//! flush moves everything staged into the published map in one step and
//! notifies watchers once, so the number of notifications is bounded by the
//! flush rate no matter how many samples arrive.
//!
//! The published map is an immutable [`LiveSnapshot`] replaced on every flush;
//! readers holding an older snapshot keep seeing it unchanged.
//!
//! While the buffer is inactive (nobody is subscribed) the flush loop parks
//! instead of ticking.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::PvValue;

/// Read-only view of the published live values as of the last flush.
pub type LiveSnapshot = Arc<HashMap<String, PvValue>>;

/// Default interval between automatic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Counters for one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Distinct PV names published.
    pub published: usize,
    /// Staged writes superseded before they were published.
    pub coalesced: usize,
}

/// What one flush moved into the published map.
#[derive(Debug, Clone)]
pub struct FlushedBatch {
    pub values: Vec<(String, PvValue)>,
    pub stats: FlushStats,
}

#[derive(Default)]
struct Staging {
    entries: HashMap<String, PvValue>,
    writes: usize,
}

pub struct UpdateBuffer {
    staging: Mutex<Staging>,
    published_tx: watch::Sender<LiveSnapshot>,
    active_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for UpdateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateBuffer {
    pub fn new() -> Self {
        let (published_tx, _) = watch::channel(LiveSnapshot::default());
        let (active_tx, _) = watch::channel(true);
        Self {
            staging: Mutex::new(Staging::default()),
            published_tx,
            active_tx,
            flush_task: Mutex::new(None),
        }
    }

    /// Upsert a sample into the staging map. No notification.
    pub fn stage(&self, pv_name: impl Into<String>, value: PvValue) {
        let mut staging = self.lock_staging();
        staging.entries.insert(pv_name.into(), value);
        staging.writes += 1;
    }

    /// Publish everything staged since the last flush.
    ///
    /// Returns `None` (and notifies nobody) when nothing was staged.
    pub fn flush(&self) -> Option<FlushedBatch> {
        let mut staging = self.lock_staging();
        if staging.entries.is_empty() {
            return None;
        }
        let writes = std::mem::take(&mut staging.writes);
        let drained: Vec<(String, PvValue)> = staging.entries.drain().collect();
        let stats = FlushStats {
            published: drained.len(),
            coalesced: writes.saturating_sub(drained.len()),
        };

        // Staging lock still held: a concurrent discard either runs before
        // the drain or after the publish, never in between.
        self.published_tx.send_modify(|snapshot| {
            let map = Arc::make_mut(snapshot);
            for (name, value) in &drained {
                map.insert(name.clone(), value.clone());
            }
        });
        drop(staging);

        log::debug!(
            "[pv-link] Flushed {} PV value(s), {} coalesced",
            stats.published,
            stats.coalesced
        );
        Some(FlushedBatch {
            values: drained,
            stats,
        })
    }

    /// Drop any staged and published value for `pv_name` right away.
    pub fn discard(&self, pv_name: &str) {
        let mut staging = self.lock_staging();
        staging.entries.remove(pv_name);
        self.published_tx.send_if_modified(|snapshot| {
            if !snapshot.contains_key(pv_name) {
                return false;
            }
            Arc::make_mut(snapshot).remove(pv_name);
            true
        });
    }

    /// Current published snapshot.
    pub fn published(&self) -> LiveSnapshot {
        self.published_tx.borrow().clone()
    }

    /// Latest published value for one PV.
    pub fn get(&self, pv_name: &str) -> Option<PvValue> {
        self.published_tx.borrow().get(pv_name).cloned()
    }

    /// Receiver notified once per flush (and on discards that change the map).
    pub fn watch(&self) -> watch::Receiver<LiveSnapshot> {
        self.published_tx.subscribe()
    }

    /// Number of distinct PV names waiting for the next flush.
    pub fn staged_len(&self) -> usize {
        self.lock_staging().entries.len()
    }

    /// Park (`false`) or resume (`true`) the flush loop. A new buffer is
    /// active. Resuming restarts the interval, so the first flush after a
    /// park lands one full interval later.
    pub fn set_active(&self, active: bool) {
        let changed = self.active_tx.send_if_modified(|current| {
            if *current == active {
                return false;
            }
            *current = active;
            true
        });
        if changed {
            log::debug!("[pv-link] Flush loop {}", if active { "resumed" } else { "parked" });
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active_tx.borrow()
    }

    /// Start the fixed-interval flush loop. `on_flush` receives every
    /// non-empty batch. A second call while running is a no-op.
    pub fn start_flush_loop<F>(self: &Arc<Self>, interval: Duration, on_flush: F)
    where
        F: Fn(FlushedBatch) + Send + Sync + 'static,
    {
        let mut task = self.flush_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let buffer: Weak<Self> = Arc::downgrade(self);
        let mut active_rx = self.active_tx.subscribe();
        log::debug!("[pv-link] Flush loop started ({:?})", interval);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                if !*active_rx.borrow_and_update() {
                    // Err: the buffer is gone.
                    if active_rx.wait_for(|active| *active).await.is_err() {
                        break;
                    }
                    ticker.reset();
                }
                tokio::select! {
                    _ = ticker.tick() => {},
                    changed = active_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    },
                }
                let Some(buffer) = buffer.upgrade() else {
                    break;
                };
                if let Some(batch) = buffer.flush() {
                    on_flush(batch);
                }
            }
        }));
    }

    /// Stop the flush loop. Staged values stay staged. Idempotent.
    pub fn stop_flush_loop(&self) {
        if let Some(handle) = self.flush_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            log::debug!("[pv-link] Flush loop stopped");
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn lock_staging(&self) -> std::sync::MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UpdateBuffer {
    fn drop(&mut self) {
        self.stop_flush_loop();
    }
}
