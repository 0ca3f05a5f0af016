//! Heartbeat monitor for the backend's value-producing process.
//!
//! The live channel can be perfectly healthy while the process that feeds it
//! has died, so liveness is polled separately over HTTP. Every failure mode
//! (network error, non-2xx, error envelope, malformed body, timeout) reports
//! the process as dead with an unknown age; a failed poll never keeps a
//! previous "alive".

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::{Duration, SystemTime},
};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{
    error::{PvLinkError, Result},
    models::{ApiResponse, HeartbeatPayload, HeartbeatState},
    query::join_url,
};

/// Default poll interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Default path of the heartbeat endpoint.
pub const DEFAULT_HEARTBEAT_PATH: &str = "/api/v1/heartbeat";

/// Callback notified with the heartbeat state.
pub type HeartbeatCallback = Arc<dyn Fn(&HeartbeatState) + Send + Sync>;

struct Shared {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    state_tx: watch::Sender<HeartbeatState>,
    listeners: Mutex<Vec<(u64, HeartbeatCallback)>>,
    next_id: AtomicU64,
}

impl Shared {
    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, HeartbeatCallback)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_payload(&self) -> Result<HeartbeatPayload> {
        let response = self.http.get(&self.url).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PvLinkError::ServerError {
                status_code: status.as_u16(),
                message: format!("heartbeat endpoint returned {}", status),
            });
        }
        let body = response.text().await?;
        let envelope: ApiResponse<HeartbeatPayload> = serde_json::from_str(&body)?;
        if !envelope.is_success() {
            return Err(PvLinkError::ServerError {
                status_code: status.as_u16(),
                message: envelope.error_text(),
            });
        }
        envelope
            .payload
            .ok_or_else(|| PvLinkError::SerializationError("heartbeat response has no payload".to_string()))
    }

    async fn poll(&self) -> HeartbeatState {
        let was_alive = self.state_tx.borrow().alive;
        let state = match self.fetch_payload().await {
            Ok(payload) => {
                let state = HeartbeatState::from_payload(&payload, SystemTime::now());
                if state.alive && !was_alive {
                    log::info!("[HEARTBEAT] Monitor alive (age {:?}s)", state.age_seconds);
                } else if !state.alive && was_alive {
                    log::warn!("[HEARTBEAT] Monitor reports itself dead");
                }
                state
            },
            Err(e) => {
                if was_alive {
                    log::warn!("[HEARTBEAT] Check failed, assuming dead: {}", e);
                } else {
                    log::debug!("[HEARTBEAT] Check failed: {}", e);
                }
                HeartbeatState::failed(SystemTime::now())
            },
        };
        self.publish(&state);
        state
    }

    fn publish(&self, state: &HeartbeatState) {
        self.state_tx.send_replace(state.clone());
        let listeners: Vec<HeartbeatCallback> = self.listeners().iter().map(|(_, cb)| cb.clone()).collect();
        for listener in listeners {
            notify(&listener, state);
        }
    }
}

fn notify(listener: &HeartbeatCallback, state: &HeartbeatState) {
    if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
        log::error!("[HEARTBEAT] Listener panicked");
    }
}

/// Polls the heartbeat endpoint on a fixed interval.
pub struct HeartbeatMonitor {
    shared: Arc<Shared>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Create a monitor for `{base_url}{path}`. Nothing is polled until
    /// [`start`](Self::start) or [`poll_once`](Self::poll_once).
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        path: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(PvLinkError::ConfigurationError(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        let (state_tx, _) = watch::channel(HeartbeatState::default());
        Ok(Self {
            shared: Arc::new(Shared {
                http,
                url: join_url(base_url, path),
                timeout,
                state_tx,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            interval,
            task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Poll right now, publish and return the result.
    pub async fn poll_once(&self) -> HeartbeatState {
        self.shared.poll().await
    }

    /// Last known state (default: not alive, never checked).
    pub fn state(&self) -> HeartbeatState {
        self.shared.state_tx.borrow().clone()
    }

    /// Receiver notified after every poll.
    pub fn watch(&self) -> watch::Receiver<HeartbeatState> {
        self.shared.state_tx.subscribe()
    }

    /// Call `callback` with the last known state now, then after every poll
    /// until the returned listener is dropped.
    #[must_use = "dropping the listener unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> HeartbeatListener
    where
        F: Fn(&HeartbeatState) + Send + Sync + 'static,
    {
        let callback: HeartbeatCallback = Arc::new(callback);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners().push((id, callback.clone()));
        notify(&callback, &self.state());
        HeartbeatListener {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Start polling. The first poll runs immediately. Idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        let interval = self.interval;
        log::debug!("[HEARTBEAT] Polling {} every {:?}", shared.url, interval);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.poll().await;
            }
        }));
    }

    /// Stop polling. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            log::debug!("[HEARTBEAT] Polling stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Registration returned by [`HeartbeatMonitor::subscribe`]; removed on drop.
pub struct HeartbeatListener {
    shared: Weak<Shared>,
    id: u64,
}

impl Drop for HeartbeatListener {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners().retain(|(id, _)| *id != self.id);
        }
    }
}
