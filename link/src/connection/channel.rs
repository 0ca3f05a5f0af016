//! The live channel: one WebSocket to the backend's PV feed.
//!
//! A background task owns the socket and runs an explicit state machine:
//!
//! - `Disconnected → Connecting → Open`, re-subscribing every registered PV
//!   name as soon as the socket opens
//! - unexpected drops go back to `Disconnected` and schedule a reconnect with
//!   exponential backoff ([`ReconnectPolicy`])
//! - `disconnect()` goes `Open → Closing → Disconnected` and suppresses
//!   automatic reconnection until the next `connect()`
//! - keepalive pings with a pong deadline detect half-open sockets
//!
//! Decoded `(pv_name, value)` batches are forwarded to an update sink; what
//! happens to them next (filtering, buffering) is not the channel's concern.

use crate::{
    connection::{
        backoff::{ReconnectDecision, ReconnectPolicy},
        websocket::{dial, encode_message, parse_message, resolve_ws_url, WebSocketStream},
        FAR_FUTURE, MAX_WS_TEXT_MESSAGE_BYTES,
    },
    error::{PvLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    models::{ChannelState, ClientMessage, ConnectionOptions, FeedEvent, PvValue},
    timeouts::PvLinkTimeouts,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A batch of values decoded from one feed frame.
pub type FeedBatch = Vec<(String, PvValue)>;

/// Commands sent from the public handle to the background task.
#[derive(Debug)]
enum ChannelCmd {
    Connect,
    Disconnect,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Shutdown,
}

/// Handle to the live channel.
///
/// Construct with [`TransportChannel::new`], then [`start`](Self::start) the
/// background task inside a tokio runtime. Commands issued before `start`
/// are queued and applied when the task comes up.
pub struct TransportChannel {
    cmd_tx: mpsc::UnboundedSender<ChannelCmd>,
    pending: Mutex<Option<ChannelTask>>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    reconnect_attempts: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
    ws_url: String,
}

impl TransportChannel {
    /// Prepare a channel for `base_url`. Fails only on an unusable URL.
    pub fn new(
        base_url: &str,
        options: ConnectionOptions,
        timeouts: PvLinkTimeouts,
        event_handlers: EventHandlers,
        updates_tx: mpsc::Sender<FeedBatch>,
    ) -> Result<Self> {
        let ws_url = resolve_ws_url(base_url, &options)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let reconnect_attempts = Arc::new(AtomicU32::new(0));

        let task = ChannelTask {
            url: ws_url.clone(),
            timeouts,
            handlers: event_handlers,
            policy: ReconnectPolicy::new(&options),
            desired: BTreeSet::new(),
            state_tx: state_tx.clone(),
            reconnect_attempts: reconnect_attempts.clone(),
            updates_tx,
            cmd_rx,
        };

        Ok(Self {
            cmd_tx,
            pending: Mutex::new(Some(task)),
            state_tx,
            reconnect_attempts,
            task: Mutex::new(None),
            ws_url,
        })
    }

    /// Spawn the background task. Idempotent; must run inside a tokio runtime.
    pub fn start(&self) {
        let Some(task) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        log::debug!("[pv-link] Starting live channel task for {}", self.ws_url);
        let handle = tokio::spawn(task.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Open the connection. No-op while open or while an attempt (or a
    /// scheduled reconnect) is in flight. After a terminal give-up or an
    /// explicit disconnect, this re-arms automatic reconnection.
    pub fn connect(&self) {
        self.send(ChannelCmd::Connect);
    }

    /// Close the connection and suppress automatic reconnection.
    pub fn disconnect(&self) {
        self.send(ChannelCmd::Disconnect);
    }

    /// Add PV names to the feed. Sent immediately when open, otherwise
    /// queued until the next open.
    pub fn subscribe(&self, pv_names: Vec<String>) {
        if !pv_names.is_empty() {
            self.send(ChannelCmd::Subscribe(pv_names));
        }
    }

    /// Remove PV names from the feed.
    pub fn unsubscribe(&self, pv_names: Vec<String>) {
        if !pv_names.is_empty() {
            self.send(ChannelCmd::Unsubscribe(pv_names));
        }
    }

    /// Close the connection and stop the background task for good.
    pub fn shutdown(&self) {
        self.send(ChannelCmd::Shutdown);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Whether the WebSocket is currently open.
    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// The WebSocket URL this channel dials.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn send(&self, cmd: ChannelCmd) {
        if self.cmd_tx.send(cmd).is_err() {
            log::debug!("[pv-link] Live channel task has exited; command dropped");
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        // Best-effort shutdown signal.
        let _ = self.cmd_tx.send(ChannelCmd::Shutdown);
    }
}

// ── Background task ─────────────────────────────────────────────────────────

enum Phase {
    /// Not connected and nothing scheduled; waiting for `Connect`.
    Idle,
    /// Dial now.
    Dial,
    /// Reconnect scheduled after the delay.
    Backoff(Duration),
}

enum OpenOutcome {
    /// The socket dropped or failed; reconnect policy decides what's next.
    Lost(DisconnectReason),
    /// Closed on request.
    Disconnected,
    Shutdown,
}

struct ChannelTask {
    url: String,
    timeouts: PvLinkTimeouts,
    handlers: EventHandlers,
    policy: ReconnectPolicy,
    /// Every PV name the registry wants, whether or not the socket is open.
    desired: BTreeSet<String>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    reconnect_attempts: Arc<AtomicU32>,
    updates_tx: mpsc::Sender<FeedBatch>,
    cmd_rx: mpsc::UnboundedReceiver<ChannelCmd>,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => match self.cmd_rx.recv().await {
                    Some(ChannelCmd::Connect) => {
                        self.policy.rearm();
                        self.reconnect_attempts.store(0, Ordering::SeqCst);
                        Phase::Dial
                    },
                    Some(ChannelCmd::Disconnect) => {
                        self.policy.suppress();
                        Phase::Idle
                    },
                    Some(ChannelCmd::Subscribe(names)) => {
                        self.desired.extend(names);
                        Phase::Idle
                    },
                    Some(ChannelCmd::Unsubscribe(names)) => {
                        self.forget(&names);
                        Phase::Idle
                    },
                    Some(ChannelCmd::Shutdown) | None => return,
                },
                Phase::Backoff(delay) => match self.wait_backoff(delay).await {
                    Some(next) => next,
                    None => return,
                },
                Phase::Dial => {
                    self.set_state(ChannelState::Connecting);
                    match dial(&self.url, &self.timeouts).await {
                        Ok(ws) => {
                            log::info!("[pv-link] Live feed connected: {}", self.url);
                            self.policy.reset();
                            self.reconnect_attempts.store(0, Ordering::SeqCst);
                            self.set_state(ChannelState::Open);
                            self.handlers.emit_connect();
                            match self.run_open(ws).await {
                                OpenOutcome::Lost(reason) => {
                                    log::warn!("[pv-link] Live feed lost: {}", reason);
                                    self.set_state(ChannelState::Disconnected);
                                    self.handlers.emit_disconnect(reason);
                                    self.schedule_reconnect()
                                },
                                OpenOutcome::Disconnected => Phase::Idle,
                                OpenOutcome::Shutdown => return,
                            }
                        },
                        Err(e) => {
                            log::warn!("[pv-link] Live feed connection failed: {}", e);
                            self.handlers.emit_error(ConnectionError::transient(e.to_string()));
                            self.set_state(ChannelState::Disconnected);
                            self.schedule_reconnect()
                        },
                    }
                },
            };
        }
    }

    fn schedule_reconnect(&mut self) -> Phase {
        match self.policy.next() {
            ReconnectDecision::Retry { attempt, delay } => {
                self.reconnect_attempts.store(attempt, Ordering::SeqCst);
                log::info!("[pv-link] Attempting reconnection in {:?} (attempt {})", delay, attempt);
                self.handlers.emit_reconnect_scheduled(attempt, delay);
                Phase::Backoff(delay)
            },
            ReconnectDecision::Suppressed => {
                log::debug!("[pv-link] Reconnection suppressed");
                Phase::Idle
            },
            ReconnectDecision::GiveUp { attempts } => {
                log::warn!("[pv-link] Max reconnection attempts ({}) reached", attempts);
                self.handlers.emit_error(ConnectionError::fatal(format!(
                    "Max reconnection attempts ({}) reached",
                    attempts
                )));
                Phase::Idle
            },
        }
    }

    /// Sleep out a backoff delay while still serving commands.
    /// Returns `None` on shutdown.
    async fn wait_backoff(&mut self, delay: Duration) -> Option<Phase> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    // A reconnect is already scheduled.
                    Some(ChannelCmd::Connect) => {},
                    Some(ChannelCmd::Disconnect) => {
                        log::debug!("[pv-link] Scheduled reconnect cancelled by disconnect");
                        self.policy.suppress();
                        return Some(Phase::Idle);
                    },
                    Some(ChannelCmd::Subscribe(names)) => self.desired.extend(names),
                    Some(ChannelCmd::Unsubscribe(names)) => self.forget(&names),
                    Some(ChannelCmd::Shutdown) | None => return None,
                },
                _ = &mut sleep => return Some(Phase::Dial),
            }
        }
    }

    /// Serve an open socket until it closes.
    async fn run_open(&mut self, mut ws: WebSocketStream) -> OpenOutcome {
        if !self.desired.is_empty() {
            let pv_names: Vec<String> = self.desired.iter().cloned().collect();
            log::info!("[pv-link] Subscribing {} PV(s) after open", pv_names.len());
            if let Err(e) = self.send_message(&mut ws, &ClientMessage::Subscribe { pv_names }).await {
                return OpenOutcome::Lost(DisconnectReason::new(e.to_string()));
            }
        }

        let keepalive = self.timeouts.keepalive_interval;
        let has_keepalive = !keepalive.is_zero();
        let keepalive_dur = if has_keepalive { keepalive } else { FAR_FUTURE };
        let pong_timeout = self.timeouts.pong_timeout;
        let has_pong_timeout = has_keepalive && !pong_timeout.is_zero();
        let mut idle_deadline = TokioInstant::now() + keepalive_dur;
        let mut awaiting_pong = false;
        let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

        loop {
            let idle_sleep = tokio::time::sleep_until(idle_deadline);
            tokio::pin!(idle_sleep);
            let pong_sleep = tokio::time::sleep_until(pong_deadline);
            tokio::pin!(pong_sleep);

            tokio::select! {
                biased;

                _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                    return OpenOutcome::Lost(DisconnectReason::new(format!(
                        "Pong timeout ({:?}), server unresponsive",
                        pong_timeout
                    )));
                }

                cmd = self.cmd_rx.recv() => {
                    let result = match cmd {
                        Some(ChannelCmd::Connect) => {
                            log::debug!("[pv-link] connect() ignored: already open");
                            Ok(())
                        },
                        Some(ChannelCmd::Subscribe(names)) => {
                            let added: Vec<String> =
                                names.into_iter().filter(|n| self.desired.insert(n.clone())).collect();
                            if added.is_empty() {
                                Ok(())
                            } else {
                                self.send_message(&mut ws, &ClientMessage::Subscribe { pv_names: added }).await
                            }
                        },
                        Some(ChannelCmd::Unsubscribe(names)) => {
                            let removed: Vec<String> =
                                names.into_iter().filter(|n| self.desired.remove(n)).collect();
                            if removed.is_empty() {
                                Ok(())
                            } else {
                                self.send_message(&mut ws, &ClientMessage::Unsubscribe { pv_names: removed }).await
                            }
                        },
                        Some(ChannelCmd::Disconnect) => {
                            self.policy.suppress();
                            self.close(&mut ws, "Client disconnected").await;
                            return OpenOutcome::Disconnected;
                        },
                        Some(ChannelCmd::Shutdown) | None => {
                            self.policy.suppress();
                            self.close(&mut ws, "Channel shut down").await;
                            return OpenOutcome::Shutdown;
                        },
                    };
                    if let Err(e) = result {
                        return OpenOutcome::Lost(DisconnectReason::new(e.to_string()));
                    }
                }

                _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                    if let Err(e) = ws.send(Message::Ping(Bytes::new())).await {
                        return OpenOutcome::Lost(DisconnectReason::new(format!(
                            "Keepalive ping failed: {}",
                            e
                        )));
                    }
                    if has_pong_timeout {
                        awaiting_pong = true;
                        pong_deadline = TokioInstant::now() + pong_timeout;
                    }
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                }

                frame = ws.next() => {
                    // Any frame proves the connection is alive.
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                    if awaiting_pong {
                        awaiting_pong = false;
                        pong_deadline = TokioInstant::now() + FAR_FUTURE;
                    }

                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > MAX_WS_TEXT_MESSAGE_BYTES {
                                log::warn!("[pv-link] Text frame too large ({} bytes), dropped", text.len());
                                continue;
                            }
                            self.handle_text(&text).await;
                        },
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.handle_text(text).await,
                            Err(_) => log::warn!("[pv-link] Non-UTF-8 binary frame dropped ({} bytes)", data.len()),
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = ws.send(Message::Pong(payload)).await {
                                return OpenOutcome::Lost(DisconnectReason::new(format!(
                                    "Pong reply failed: {}",
                                    e
                                )));
                            }
                        },
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {},
                        Some(Ok(Message::Close(frame))) => {
                            let reason = match frame {
                                Some(f) => DisconnectReason::with_code(f.reason.to_string(), f.code.into()),
                                None => DisconnectReason::new("Server closed connection"),
                            };
                            return OpenOutcome::Lost(reason);
                        },
                        Some(Err(e)) => {
                            let msg = e.to_string();
                            self.handlers.emit_error(ConnectionError::transient(&msg));
                            return OpenOutcome::Lost(DisconnectReason::new(format!("WebSocket error: {}", msg)));
                        },
                        None => {
                            return OpenOutcome::Lost(DisconnectReason::new("WebSocket stream ended"));
                        },
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        self.handlers.emit_receive(text);
        match parse_message(text) {
            Ok(FeedEvent::Values { kind, values }) => {
                log::trace!("[pv-link] {:?} frame with {} value(s)", kind, values.len());
                if values.is_empty() {
                    return;
                }
                if self.updates_tx.send(values).await.is_err() {
                    log::debug!("[pv-link] Update sink dropped; discarding values");
                }
            },
            Ok(FeedEvent::Heartbeat) => log::trace!("[pv-link] Feed heartbeat"),
            Ok(FeedEvent::Error { message }) => {
                log::warn!("[pv-link] Server reported error: {}", message);
                self.handlers.emit_error(ConnectionError::transient(message));
            },
            Ok(FeedEvent::Unknown) => log::debug!("[pv-link] Ignoring frame of unknown type"),
            Err(e) => log::warn!("[pv-link] {}", e),
        }
    }

    async fn send_message(&self, ws: &mut WebSocketStream, msg: &ClientMessage) -> Result<()> {
        let payload = encode_message(msg)?;
        self.handlers.emit_send(&payload);
        let send = ws.send(Message::Text(payload.into()));
        let result = if PvLinkTimeouts::is_no_timeout(self.timeouts.send_timeout) {
            send.await
        } else {
            tokio::time::timeout(self.timeouts.send_timeout, send)
                .await
                .map_err(|_| {
                    PvLinkError::TimeoutError(format!("Send timeout ({:?})", self.timeouts.send_timeout))
                })?
        };
        result.map_err(|e| PvLinkError::WebSocketError(format!("Failed to send: {}", e)))
    }

    async fn close(&self, ws: &mut WebSocketStream, why: &str) {
        self.set_state(ChannelState::Closing);
        let _ = ws.close(None).await;
        self.set_state(ChannelState::Disconnected);
        self.handlers.emit_disconnect(DisconnectReason::client_closed(why));
    }

    fn forget(&mut self, names: &[String]) {
        for name in names {
            self.desired.remove(name);
        }
    }

    fn set_state(&self, next: ChannelState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                log::warn!("[pv-link] Rejected channel transition {} -> {}", state, next);
                return false;
            }
            log::debug!("[pv-link] Channel {} -> {}", state, next);
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(base_url: &str) -> Result<(TransportChannel, mpsc::Receiver<FeedBatch>)> {
        let (tx, rx) = mpsc::channel(16);
        let channel = TransportChannel::new(
            base_url,
            ConnectionOptions::default(),
            PvLinkTimeouts::fast(),
            EventHandlers::new(),
            tx,
        )?;
        Ok((channel, rx))
    }

    #[test]
    fn test_new_rejects_bad_base_url() {
        assert!(channel("localhost without scheme").is_err());
    }

    #[test]
    fn test_new_starts_disconnected() {
        let (channel, _rx) = channel("http://127.0.0.1:1").unwrap();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(!channel.is_connected());
        assert_eq!(channel.reconnect_attempts(), 0);
        assert_eq!(channel.ws_url(), "ws://127.0.0.1:1/api/v1/ws/pvs");
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (channel, _rx) = channel("http://127.0.0.1:1").unwrap();
        channel.start();
        channel.start();
        assert!(channel.task.lock().unwrap().is_some());
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_commands_before_start_are_queued() {
        let (channel, _rx) = channel("http://127.0.0.1:1").unwrap();
        channel.subscribe(vec!["A".to_string()]);
        channel.unsubscribe(Vec::new());
        channel.start();
        channel.shutdown();
        let handle = channel.task.lock().unwrap().take().unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should exit on shutdown")
            .unwrap();
    }
}
