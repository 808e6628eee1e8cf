//! In-process mock dispatcher for end-to-end connector tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use judge_connector::config::Config;
use judge_connector::engine::CommandEngine;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const SESSION_COOKIE: &str = "sid=ok";

#[derive(Default)]
pub struct MockState {
    pub logins: AtomicUsize,
    pub connections: AtomicUsize,
    /// Credential frame of every connection, in connect order.
    pub first_frames: Mutex<Vec<(String, Instant)>>,
    /// Every later frame, as received.
    pub frames: Mutex<Vec<Value>>,
    /// Close the first N connections right after the credential frame.
    pub drop_connections: AtomicUsize,
    pub files: Mutex<HashMap<String, String>>,
    pub link_requests: Mutex<Vec<Value>>,
    live: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

pub struct MockDispatcher {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockDispatcher {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap()).await
    }

    pub async fn start_on(addr: SocketAddr) -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/judge", get(check))
            .route("/login", post(login))
            .route("/judge/noop", get(|| async { StatusCode::OK }))
            .route("/judge/conn/info", get(conn_info))
            .route("/judge/conn/websocket", get(websocket))
            .route("/d/{domain}/judge/files", post(file_links))
            .route("/fs/{*name}", get(file_body))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            state,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn put_file(&self, name: &str, body: &str) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), body.to_string());
    }

    /// Push a frame to the currently open connection.
    pub fn send(&self, frame: Value) {
        let live = self.state.live.lock().unwrap();
        live.as_ref()
            .expect("no open connection")
            .send(frame.to_string())
            .unwrap();
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn frames_for(&self, rid: &str) -> Vec<Value> {
        self.state
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f["rid"] == rid)
            .cloned()
            .collect()
    }

    pub fn has_end(&self, rid: &str) -> bool {
        self.frames_for(rid).iter().any(|f| f["key"] == "end")
    }
}

impl Drop for MockDispatcher {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn check(headers: HeaderMap) -> StatusCode {
    let authed = headers
        .get("cookie")
        .and_then(|c| c.to_str().ok())
        .is_some_and(|c| c.contains(SESSION_COOKIE));
    if authed {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    }
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if body["uname"] != "judge" || body["password"] != "secret" {
        return StatusCode::FORBIDDEN.into_response();
    }
    state.logins.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::FOUND,
        [
            ("set-cookie", format!("{SESSION_COOKIE}; path=/; httponly")),
            ("location", "/".to_string()),
        ],
    )
        .into_response()
}

async fn conn_info(State(state): State<Arc<MockState>>) -> Json<Value> {
    let n = state.connections.load(Ordering::SeqCst);
    Json(json!({ "entropy": format!("token-{n}") }))
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<MockState>) {
    let (mut sink, mut stream) = socket.split();
    let Some(Ok(Message::Text(first))) = stream.next().await else {
        return;
    };
    state
        .first_frames
        .lock()
        .unwrap()
        .push((first.as_str().to_string(), Instant::now()));
    state.connections.fetch_add(1, Ordering::SeqCst);

    let drop_now = state
        .drop_connections
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if drop_now {
        let _ = sink.close().await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *state.live.lock().unwrap() = Some(tx);
    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(text) = outgoing else { break };
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        state.frames.lock().unwrap().push(value);
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

async fn file_links(
    State(state): State<Arc<MockState>>,
    UrlPath(domain): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if check(headers).await != StatusCode::OK {
        return StatusCode::FORBIDDEN.into_response();
    }
    let links: HashMap<String, String> = body["files"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(|name| (name.to_string(), format!("/fs/{name}")))
        .collect();
    state
        .link_requests
        .lock()
        .unwrap()
        .push(json!({ "domain": domain, "body": body }));
    Json(json!({ "links": links })).into_response()
}

async fn file_body(State(state): State<Arc<MockState>>, UrlPath(name): UrlPath<String>) -> Response {
    match state.files.lock().unwrap().get(&name) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Config for one host pointing at `mock`, with an engine script run by `/bin/sh`.
pub fn config(mock: &MockDispatcher, dir: &Path, engine_script: &str) -> Config {
    let raw = format!(
        r#"
        tmp_dir = "{tmp}"
        cache_dir = "{cache}"
        concurrency = 2
        tmpfs = false
        retry_delay_secs = 1
        debug = true

        [engine]
        program = "/bin/sh"
        args = ["-c", {script}, "engine"]

        [[hosts]]
        host = "mock"
        server_url = "{url}"
        uname = "judge"
        password = "secret"
        no_status = true
        "#,
        tmp = dir.join("tmp").display(),
        cache = dir.join("cache").display(),
        script = toml_string(engine_script),
        url = mock.url(),
    );
    Config::from_toml(&raw).unwrap()
}

fn toml_string(s: &str) -> String {
    serde_json::to_string(s).unwrap()
}

pub struct Connector {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Connector {
    pub fn spawn(config: Config) -> Self {
        let engine = Arc::new(CommandEngine::new(&config.engine));
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(judge_connector::run(config, engine, rx));
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}
