//! Live-value client with builder pattern.
//!
//! [`PvLinkClient`] owns one instance of each service (live channel,
//! subscription registry, update buffer, heartbeat monitor, REST fetcher)
//! and wires them together:
//!
//! ```text
//! channel frames ─► pump ─► registry interest check ─► buffer.stage
//!                                                          │ flush tick
//!                     per-PV callbacks ◄─ registry ◄───────┤
//!                     watch_live_values() ◄────────────────┘
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{
    buffer::{FlushedBatch, LiveSnapshot, UpdateBuffer, DEFAULT_FLUSH_INTERVAL},
    config::LinkConfig,
    connection::{FeedBatch, TransportChannel, DEFAULT_UPDATE_CHANNEL_CAPACITY},
    error::{PvLinkError, Result},
    event_handlers::EventHandlers,
    heartbeat::{HeartbeatListener, HeartbeatMonitor, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_PATH},
    models::{ChannelState, ConnectionOptions, HeartbeatState, PvValue},
    query::{LiveValuesFetcher, DEFAULT_LIVE_VALUES_PATH},
    subscription::{ConsumerSubscription, PvCallback, SubscriptionHandle, SubscriptionRegistry, SubscriptionSink},
    timeouts::PvLinkTimeouts,
    tolerance::{evaluate_pv, unix_now, PvDisplayState, Tolerance},
};

/// Default age after which a sample counts as stale.
pub const DEFAULT_STALE_THRESHOLD_SECS: f64 = 60.0;

/// Registry sink that also drops buffered values for released names and
/// parks the flush loop while no PV has a consumer.
struct LinkSink {
    channel: Arc<TransportChannel>,
    buffer: Arc<UpdateBuffer>,
    /// PV names with at least one consumer. The registry calls the sink
    /// under its lock, so updates are serialized.
    active_names: AtomicUsize,
}

impl LinkSink {
    fn new(channel: Arc<TransportChannel>, buffer: Arc<UpdateBuffer>) -> Self {
        buffer.set_active(false);
        Self {
            channel,
            buffer,
            active_names: AtomicUsize::new(0),
        }
    }
}

impl SubscriptionSink for LinkSink {
    fn subscribe(&self, pv_names: Vec<String>) {
        self.active_names.fetch_add(pv_names.len(), Ordering::SeqCst);
        self.buffer.set_active(true);
        self.channel.subscribe(pv_names);
    }

    fn unsubscribe(&self, pv_names: Vec<String>) {
        for name in &pv_names {
            self.buffer.discard(name);
        }
        let released = pv_names.len();
        let before = self
            .active_names
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(released)))
            .unwrap_or(0);
        if before <= released {
            self.buffer.set_active(false);
        }
        self.channel.unsubscribe(pv_names);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
    Disposed,
}

struct ClientInner {
    base_url: String,
    timeouts: PvLinkTimeouts,
    flush_interval: Duration,
    stale_threshold_secs: f64,
    fallback_interval: Option<Duration>,
    channel: Arc<TransportChannel>,
    registry: SubscriptionRegistry,
    buffer: Arc<UpdateBuffer>,
    heartbeat: HeartbeatMonitor,
    fetcher: LiveValuesFetcher,
    updates_rx: Mutex<Option<mpsc::Receiver<FeedBatch>>>,
    fallback_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // The pump and the registry sink keep the channel alive; only an
        // explicit shutdown ends its task.
        if let Some(handle) = self.fallback_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.buffer.stop_flush_loop();
        self.heartbeat.stop();
        self.channel.shutdown();
    }
}

/// Live PV value client.
///
/// Use [`PvLinkClientBuilder`] to construct instances. Cloning shares the
/// same services.
///
/// # Examples
///
/// ```rust,no_run
/// use pv_link::PvLinkClient;
///
/// # async fn example() -> pv_link::Result<()> {
/// let client = PvLinkClient::builder()
///     .base_url("http://localhost:8080")
///     .build()?;
/// client.start()?;
///
/// let _handle = client.subscribe("LN:MAG1:I", |name, value| {
///     println!("{} = {} ({})", name, value.value, value.severity);
/// });
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PvLinkClient {
    inner: Arc<ClientInner>,
}

impl PvLinkClient {
    /// Create a new builder for configuring the client
    pub fn builder() -> PvLinkClientBuilder {
        PvLinkClientBuilder::new()
    }

    /// Start every background task and connect the live channel.
    ///
    /// Must be called inside a tokio runtime. Calling it while running is a
    /// no-op; after [`stop`](Self::stop) it starts everything again.
    pub fn start(&self) -> Result<()> {
        tokio::runtime::Handle::try_current().map_err(|_| {
            PvLinkError::ConfigurationError("PvLinkClient::start requires a tokio runtime".to_string())
        })?;

        let inner = &self.inner;
        let mut lifecycle = inner.lock_lifecycle();
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Disposed => return Err(PvLinkError::ChannelClosed),
            Lifecycle::Created | Lifecycle::Stopped => {},
        }

        inner.channel.start();
        self.spawn_pump();

        let registry = inner.registry.clone();
        inner.buffer.start_flush_loop(inner.flush_interval, move |batch| {
            dispatch_batch(&registry, &batch);
        });

        inner.heartbeat.start();
        self.spawn_fallback();
        inner.channel.connect();

        *lifecycle = Lifecycle::Running;
        log::info!("[pv-link] Client started for {}", inner.base_url);
        Ok(())
    }

    /// Stop timers and disconnect. Registrations and published values are
    /// kept; [`start`](Self::start) resumes. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lock_lifecycle();
        if *lifecycle != Lifecycle::Running {
            return;
        }
        inner.stop_tasks();
        inner.channel.disconnect();
        *lifecycle = Lifecycle::Stopped;
        log::info!("[pv-link] Client stopped");
    }

    /// Stop, drop every registration and shut the channel down for good.
    /// Idempotent.
    pub fn dispose(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lock_lifecycle();
        if *lifecycle == Lifecycle::Disposed {
            return;
        }
        inner.stop_tasks();
        inner.registry.clear();
        inner.channel.shutdown();
        *lifecycle = Lifecycle::Disposed;
        log::info!("[pv-link] Client disposed");
    }

    /// Whether [`start`](Self::start) has run and neither `stop` nor
    /// `dispose` has been called since.
    pub fn is_running(&self) -> bool {
        *self.inner.lock_lifecycle() == Lifecycle::Running
    }

    /// Register a per-PV callback. It receives coalesced values once per
    /// flush. Drop the handle to unsubscribe.
    #[must_use = "dropping the handle unsubscribes immediately"]
    pub fn subscribe<F>(&self, pv_name: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&str, &PvValue) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(pv_name, callback)
    }

    /// A consumer whose PV set can be changed with
    /// [`ConsumerSubscription::set_pv_names`].
    pub fn consumer<F>(&self, callback: F) -> ConsumerSubscription
    where
        F: Fn(&str, &PvValue) + Send + Sync + 'static,
    {
        let callback: PvCallback = Arc::new(callback);
        ConsumerSubscription::new(self.inner.registry.clone(), callback)
    }

    /// Published values as of the last flush.
    pub fn live_values(&self) -> LiveSnapshot {
        self.inner.buffer.published()
    }

    pub fn live_value(&self, pv_name: &str) -> Option<PvValue> {
        self.inner.buffer.get(pv_name)
    }

    /// Receiver notified once per flush.
    pub fn watch_live_values(&self) -> watch::Receiver<LiveSnapshot> {
        self.inner.buffer.watch()
    }

    /// Publish staged values now instead of waiting for the next tick.
    pub fn flush_now(&self) -> Option<FlushedBatch> {
        let batch = self.inner.buffer.flush()?;
        dispatch_batch(&self.inner.registry, &batch);
        Some(batch)
    }

    pub fn heartbeat(&self) -> HeartbeatState {
        self.inner.heartbeat.state()
    }

    pub fn watch_heartbeat(&self) -> watch::Receiver<HeartbeatState> {
        self.inner.heartbeat.watch()
    }

    /// See [`HeartbeatMonitor::subscribe`].
    #[must_use = "dropping the listener unsubscribes immediately"]
    pub fn subscribe_heartbeat<F>(&self, callback: F) -> HeartbeatListener
    where
        F: Fn(&HeartbeatState) + Send + Sync + 'static,
    {
        self.inner.heartbeat.subscribe(callback)
    }

    pub fn connection_state(&self) -> ChannelState {
        self.inner.channel.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.channel.watch_state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
    }

    /// Display state of `pv_name` against a saved value, using the current
    /// published sample and heartbeat.
    pub fn evaluate(&self, pv_name: &str, saved: &JsonValue, tolerance: Tolerance) -> PvDisplayState {
        let live = self.inner.buffer.get(pv_name);
        evaluate_pv(
            saved,
            live.as_ref(),
            tolerance,
            &self.inner.heartbeat.state(),
            self.inner.stale_threshold_secs,
            unix_now(),
        )
    }

    /// One-shot REST read, independent of the live channel.
    pub async fn fetch_live_values(&self, pv_names: &[String]) -> Result<HashMap<String, PvValue>> {
        self.inner.fetcher.fetch(pv_names).await
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn timeouts(&self) -> &PvLinkTimeouts {
        &self.inner.timeouts
    }

    pub fn stale_threshold_secs(&self) -> f64 {
        self.inner.stale_threshold_secs
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.inner.channel
    }

    pub fn heartbeat_monitor(&self) -> &HeartbeatMonitor {
        &self.inner.heartbeat
    }

    /// Move decoded batches from the channel into the buffer, dropping names
    /// nobody is subscribed to. Runs until the channel task exits.
    fn spawn_pump(&self) {
        let Some(mut updates_rx) = self.inner.updates_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        let registry = self.inner.registry.clone();
        let buffer = self.inner.buffer.clone();
        tokio::spawn(async move {
            while let Some(batch) = updates_rx.recv().await {
                let received = batch.len();
                let staged = registry.stage_interested(batch, &buffer);
                if staged < received {
                    log::trace!("[pv-link] Dropped {} value(s) without consumers", received - staged);
                }
            }
            log::debug!("[pv-link] Update pump finished");
        });
    }

    /// Poll the REST endpoint while the live channel is not open.
    fn spawn_fallback(&self) {
        let Some(interval) = self.inner.fallback_interval else {
            return;
        };
        let mut task = self.inner.fallback_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let state_rx = self.inner.channel.watch_state();
        let registry = self.inner.registry.clone();
        let buffer = self.inner.buffer.clone();
        let fetcher = self.inner.fetcher.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if state_rx.borrow().is_open() {
                    continue;
                }
                let pv_names = registry.active_pv_names();
                if pv_names.is_empty() {
                    continue;
                }
                match fetcher.fetch(&pv_names).await {
                    Ok(values) => {
                        // The channel may have opened while the request was out.
                        if state_rx.borrow().is_open() {
                            continue;
                        }
                        let staged = registry.stage_interested(values, &buffer);
                        log::debug!("[LIVE_VALUES] Fallback poll staged {} value(s)", staged);
                    },
                    Err(e) => log::debug!("[LIVE_VALUES] Fallback poll failed: {}", e),
                }
            }
        }));
    }
}

impl ClientInner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_tasks(&self) {
        self.buffer.stop_flush_loop();
        self.heartbeat.stop();
        if let Some(handle) = self.fallback_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

fn dispatch_batch(registry: &SubscriptionRegistry, batch: &FlushedBatch) {
    for (pv_name, value) in &batch.values {
        registry.dispatch(pv_name, value);
    }
}

/// Builder for [`PvLinkClient`].
pub struct PvLinkClientBuilder {
    base_url: Option<String>,
    timeouts: PvLinkTimeouts,
    connection_options: ConnectionOptions,
    event_handlers: EventHandlers,
    flush_interval: Duration,
    heartbeat_interval: Duration,
    heartbeat_path: String,
    live_values_path: String,
    stale_threshold_secs: f64,
    fallback_interval: Option<Duration>,
    max_retries: u32,
}

impl PvLinkClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            timeouts: PvLinkTimeouts::default(),
            connection_options: ConnectionOptions::default(),
            event_handlers: EventHandlers::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_path: DEFAULT_HEARTBEAT_PATH.to_string(),
            live_values_path: DEFAULT_LIVE_VALUES_PATH.to_string(),
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            fallback_interval: None,
            max_retries: 3,
        }
    }

    /// Start from a loaded [`LinkConfig`]. Later builder calls still apply.
    pub fn from_config(config: &LinkConfig) -> Self {
        let mut builder = Self::new()
            .base_url(config.server.base_url.clone())
            .timeouts(config.timeouts.to_timeouts())
            .connection_options(config.connection.clone())
            .flush_interval(config.flush_interval())
            .heartbeat_interval(config.heartbeat_interval())
            .stale_threshold_secs(config.staleness.stale_threshold_secs);
        builder.heartbeat_path = config.server.heartbeat_path.clone();
        builder.live_values_path = config.server.live_values_path.clone();
        if config.fallback.enabled {
            builder = builder.polling_fallback(config.fallback_poll_interval());
        }
        builder
    }

    /// Set the backend base URL (`http://` or `https://`)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set timeout configuration for all operations
    ///
    /// ```rust,no_run
    /// use pv_link::{PvLinkClient, PvLinkTimeouts};
    ///
    /// # fn example() -> pv_link::Result<()> {
    /// let client = PvLinkClient::builder()
    ///     .base_url("http://localhost:8080")
    ///     .timeouts(PvLinkTimeouts::fast())
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn timeouts(mut self, timeouts: PvLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set reconnection behaviour and the WebSocket endpoint
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    /// Set live channel lifecycle handlers
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Interval of the coalescing flush (default 500 ms)
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Heartbeat poll interval (default 2 s)
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Path of the heartbeat endpoint
    pub fn heartbeat_path(mut self, path: impl Into<String>) -> Self {
        self.heartbeat_path = path.into();
        self
    }

    /// Path of the batch live-values endpoint
    pub fn live_values_path(mut self, path: impl Into<String>) -> Self {
        self.live_values_path = path.into();
        self
    }

    /// Age in seconds after which samples are shown as stale (default 60)
    pub fn stale_threshold_secs(mut self, secs: f64) -> Self {
        self.stale_threshold_secs = secs;
        self
    }

    /// Poll the REST endpoint at `interval` while the live channel is down
    pub fn polling_fallback(mut self, interval: Duration) -> Self {
        self.fallback_interval = Some(interval);
        self
    }

    /// Retries for REST reads after timeouts and connection failures
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Build the client. No task is spawned until [`PvLinkClient::start`].
    pub fn build(self) -> Result<PvLinkClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| PvLinkError::ConfigurationError("base_url is required".into()))?;
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(PvLinkError::ConfigurationError(format!(
                "base_url must start with http:// or https:// (got '{}')",
                base_url
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(PvLinkError::ConfigurationError("flush_interval must be greater than zero".into()));
        }
        if self.fallback_interval.is_some_and(|d| d.is_zero()) {
            return Err(PvLinkError::ConfigurationError(
                "polling_fallback interval must be greater than zero".into(),
            ));
        }
        if !(self.stale_threshold_secs.is_finite() && self.stale_threshold_secs > 0.0) {
            return Err(PvLinkError::ConfigurationError(format!(
                "stale_threshold_secs must be positive (got {})",
                self.stale_threshold_secs
            )));
        }

        let mut client_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90));
        if !PvLinkTimeouts::is_no_timeout(self.timeouts.request_timeout) {
            client_builder = client_builder.timeout(self.timeouts.request_timeout);
        }
        if !PvLinkTimeouts::is_no_timeout(self.timeouts.connection_timeout) {
            client_builder = client_builder.connect_timeout(self.timeouts.connection_timeout);
        }
        let http_client = client_builder
            .build()
            .map_err(|e| PvLinkError::ConfigurationError(e.to_string()))?;

        let buffer = Arc::new(UpdateBuffer::new());
        let (updates_tx, updates_rx) = mpsc::channel(DEFAULT_UPDATE_CHANNEL_CAPACITY);
        let channel = Arc::new(TransportChannel::new(
            &base_url,
            self.connection_options,
            self.timeouts.clone(),
            self.event_handlers,
            updates_tx,
        )?);
        let registry = SubscriptionRegistry::new(Arc::new(LinkSink::new(channel.clone(), buffer.clone())));
        let heartbeat = HeartbeatMonitor::new(
            http_client.clone(),
            &base_url,
            &self.heartbeat_path,
            self.heartbeat_interval,
            self.timeouts.heartbeat_timeout,
        )?;
        let fetcher = LiveValuesFetcher::new(&base_url, &self.live_values_path, http_client)
            .with_max_retries(self.max_retries);

        log::debug!("[pv-link] Live feed at {}", channel.ws_url());
        Ok(PvLinkClient {
            inner: Arc::new(ClientInner {
                base_url,
                timeouts: self.timeouts,
                flush_interval: self.flush_interval,
                stale_threshold_secs: self.stale_threshold_secs,
                fallback_interval: self.fallback_interval,
                channel,
                registry,
                buffer,
                heartbeat,
                fetcher,
                updates_rx: Mutex::new(Some(updates_rx)),
                fallback_task: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::Created),
            }),
        })
    }
}
