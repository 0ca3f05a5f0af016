#![allow(dead_code)]

//! In-process stand-ins for the backend: a WebSocket live feed and a tiny
//! HTTP responder for the heartbeat and live-values endpoints.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds or `WAIT` runs out.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// Base URL on which nothing listens.
pub async fn refused_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[derive(Debug, Clone)]
enum FeedAction {
    Text(String),
    Ping(Vec<u8>),
    Close,
}

/// Minimal live-feed server. Every accepted connection forwards the client
/// frames it receives to the test and relays frames pushed with `send`.
pub struct MockFeed {
    pub addr: SocketAddr,
    received_rx: mpsc::UnboundedReceiver<Value>,
    actions_tx: broadcast::Sender<FeedAction>,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    pongs: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MockFeed {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (actions_tx, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let pongs = Arc::new(Mutex::new(Vec::new()));

        let actions = actions_tx.clone();
        let (conns, open_conns) = (connections.clone(), open.clone());
        let pongs_seen = pongs.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                conns.fetch_add(1, Ordering::SeqCst);
                open_conns.fetch_add(1, Ordering::SeqCst);
                let actions_rx = actions.subscribe();
                let received_tx = received_tx.clone();
                let open_conns = open_conns.clone();
                let pongs_seen = pongs_seen.clone();
                tokio::spawn(async move {
                    serve_feed(ws, actions_rx, received_tx, pongs_seen).await;
                    open_conns.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            received_rx,
            actions_tx,
            connections,
            open,
            pongs,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Next client frame, as JSON.
    pub async fn next_message(&mut self) -> Value {
        within("client frame", self.received_rx.recv())
            .await
            .expect("feed server stopped")
    }

    /// Nothing arrives from the client for `quiet`.
    pub async fn assert_no_message(&mut self, quiet: Duration) {
        if let Ok(Some(msg)) = tokio::time::timeout(quiet, self.received_rx.recv()).await {
            panic!("unexpected client frame: {}", msg);
        }
    }

    /// Push a frame to every open connection.
    pub fn send(&self, frame: Value) {
        let _ = self.actions_tx.send(FeedAction::Text(frame.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.actions_tx.send(FeedAction::Text(text.to_string()));
    }

    /// Send a WebSocket ping with `payload` on every open connection.
    pub fn ping(&self, payload: &[u8]) {
        let _ = self.actions_tx.send(FeedAction::Ping(payload.to_vec()));
    }

    /// Payloads of the pongs received so far.
    pub fn pongs(&self) -> Vec<Vec<u8>> {
        self.pongs.lock().unwrap().clone()
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.actions_tx.send(FeedAction::Close);
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for MockFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_feed(
    mut ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut actions_rx: broadcast::Receiver<FeedAction>,
    received_tx: mpsc::UnboundedSender<Value>,
    pongs: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = received_tx.send(value);
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                },
                Some(Ok(Message::Pong(payload))) => {
                    pongs.lock().unwrap().push(payload.to_vec());
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {},
            },
            action = actions_rx.recv() => match action {
                Ok(FeedAction::Text(text)) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                },
                Ok(FeedAction::Ping(payload)) => {
                    if ws.send(Message::Ping(payload.into())).await.is_err() {
                        break;
                    }
                },
                Ok(FeedAction::Close) => {
                    let _ = ws.close(None).await;
                    break;
                },
                Err(broadcast::error::RecvError::Lagged(_)) => {},
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// HTTP/1.1 responder keyed by request path (query string ignored).
/// Unknown paths get a 404. Every request target is recorded.
pub struct HttpStub {
    pub addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, (u16, String)>>>,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl HttpStub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<HashMap<String, (u16, String)>>> = Arc::default();
        let requests: Arc<Mutex<Vec<String>>> = Arc::default();

        let (r, q) = (routes.clone(), requests.clone());
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (routes, requests) = (r.clone(), q.clone());
                tokio::spawn(async move {
                    let _ = serve_http(stream, routes, requests).await;
                });
            }
        });

        Self {
            addr,
            routes,
            requests,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn route(&self, path: &str, status: u16, body: impl Into<String>) {
        self.routes.lock().unwrap().insert(path.to_string(), (status, body.into()));
    }

    /// Request targets (path plus query) seen so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_http(
    mut stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, (u16, String)>>>,
    requests: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&head);
    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let path = target.split('?').next().unwrap_or("/").to_string();
    requests.lock().unwrap().push(target);

    let (status, body) = routes
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or((404, r#"{"errorCode":404,"errorMessage":"not found"}"#.to_string()));
    let response = format!(
        "HTTP/1.1 {} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
