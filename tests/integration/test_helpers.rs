//! Shared test helpers for transport integration tests.
//!
//! [`MockServer`] is a small axum app on an ephemeral port that speaks the
//! server half of the HTTP/SSE protocol: `GET /sse` opens an event stream
//! (announcing `/message?sessionId=...` unless told not to) and
//! `POST /message` records submissions and optionally answers them.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mcp_sse_client::jsonrpc::Message;
use mcp_sse_client::sse::session::ConnectionStatus;
use mcp_sse_client::{SseTransport, TransportConfig};

/// One submission received on `POST /message`.
#[derive(Debug, Clone)]
pub struct Submission {
    pub session_id: Option<String>,
    pub body: Value,
}

#[derive(Default)]
struct MockState {
    /// Sender feeding the most recently opened stream.
    stream: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    /// `Last-Event-ID` header of every successful stream request, in order.
    resume_headers: Mutex<Vec<Option<String>>>,
    submissions: Mutex<Vec<Submission>>,
    stream_requests: AtomicU64,
    next_event_id: AtomicU64,
    connections: AtomicU64,
    silent: AtomicBool,
    refuse_streams: AtomicBool,
    reject_posts: AtomicBool,
    auto_reply: AtomicBool,
    inline_reply: AtomicBool,
}

/// Mock MCP server bound to `127.0.0.1` on an OS-assigned port.
pub struct MockServer {
    pub base_url: String,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockServer {
    /// Start a server that announces a session on every new stream.
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/sse", get(stream_handler))
            .route("/message", post(message_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            task,
        }
    }

    /// Stop announcing sessions on new streams; use [`announce`](Self::announce).
    pub fn silent(self) -> Self {
        self.state.silent.store(true, Ordering::SeqCst);
        self
    }

    /// Answer every request over the event stream.
    pub fn auto_reply(self) -> Self {
        self.state.auto_reply.store(true, Ordering::SeqCst);
        self
    }

    /// Answer every request in the POST response body.
    pub fn inline_reply(self) -> Self {
        self.state.inline_reply.store(true, Ordering::SeqCst);
        self
    }

    /// Make `GET /sse` fail with `503` while set.
    pub fn refuse_streams(&self, refuse: bool) {
        self.state.refuse_streams.store(refuse, Ordering::SeqCst);
    }

    /// Make `POST /message` fail with `500` while set.
    pub fn reject_posts(&self, reject: bool) {
        self.state.reject_posts.store(reject, Ordering::SeqCst);
    }

    /// Send an `endpoint` record for `session_id` on the current stream.
    pub fn announce(&self, session_id: &str) {
        self.state.push(endpoint_event(session_id));
    }

    /// Send a JSON-RPC payload as a `message` record with the next event id.
    ///
    /// Returns the event id used.
    pub fn push_message(&self, payload: &Value) -> String {
        self.state.push_message(payload)
    }

    /// Send an arbitrary record on the current stream.
    pub fn push_event(&self, event: Event) {
        self.state.push(event);
    }

    /// End the current stream from the server side.
    pub fn drop_stream(&self) {
        self.state.stream.lock().expect("stream lock").take();
    }

    /// Streams successfully opened so far.
    pub fn connections(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Every `GET /sse`, including refused ones.
    pub fn stream_requests(&self) -> u64 {
        self.state.stream_requests.load(Ordering::SeqCst)
    }

    pub fn resume_headers(&self) -> Vec<Option<String>> {
        self.state.resume_headers.lock().expect("headers lock").clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.submissions.lock().expect("submissions lock").clone()
    }
}

impl MockState {
    fn push(&self, event: Event) {
        if let Some(tx) = self.stream.lock().expect("stream lock").as_ref() {
            let _ = tx.send(event);
        }
    }

    fn push_message(&self, payload: &Value) -> String {
        let id = (self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.push(
            Event::default()
                .event("message")
                .id(id.clone())
                .data(payload.to_string()),
        );
        id
    }
}

fn endpoint_event(session_id: &str) -> Event {
    Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={session_id}"))
}

async fn stream_handler(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.stream_requests.fetch_add(1, Ordering::SeqCst);
    if state.refuse_streams.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let resume = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    state.resume_headers.lock().expect("headers lock").push(resume);

    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, rx) = mpsc::unbounded_channel();
    if !state.silent.load(Ordering::SeqCst) {
        let _ = tx.send(endpoint_event(&format!("sess-{connection}")));
    }
    *state.stream.lock().expect("stream lock") = Some(tx);

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Sse::new(stream).into_response()
}

async fn message_handler(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    if state.reject_posts.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "rejected".into());
    }

    state
        .submissions
        .lock()
        .expect("submissions lock")
        .push(Submission {
            session_id: query.get("sessionId").cloned(),
            body: body.clone(),
        });

    let reply = match (body.get("id"), body.get("method").and_then(Value::as_str)) {
        (Some(id), Some("fail")) => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        })),
        (Some(id), Some(method)) => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"echo": method, "params": body.get("params").cloned().unwrap_or(Value::Null)}
        })),
        _ => None,
    };

    match reply {
        Some(reply) if state.inline_reply.load(Ordering::SeqCst) => {
            (StatusCode::OK, reply.to_string())
        }
        Some(reply) if state.auto_reply.load(Ordering::SeqCst) => {
            state.push_message(&reply);
            (StatusCode::ACCEPTED, String::new())
        }
        _ => (StatusCode::ACCEPTED, String::new()),
    }
}

/// Configuration with short delays suited to tests.
pub fn test_config(base_url: &str) -> TransportConfig {
    let mut config = TransportConfig::new(base_url).expect("valid base url");
    config.reconnect_delay_ms = 20;
    config.reconnect_cap_ms = 100;
    config.connection_wait_seconds = 5;
    config.request_timeout_seconds = 5;
    config.connect_timeout_ms = 500;
    config
}

/// Start a transport against `config`, returning it with its notification receiver.
pub fn start_transport(config: TransportConfig) -> (SseTransport, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(16);
    let transport = SseTransport::new(config).expect("transport");
    transport.start(tx);
    (transport, rx)
}

/// Start a transport and wait until it has captured a session.
pub async fn connected_transport(server: &MockServer) -> (SseTransport, mpsc::Receiver<Message>) {
    let (transport, rx) = start_transport(test_config(&server.base_url));
    assert!(
        transport.wait_for_connection(Duration::from_secs(5)).await,
        "transport did not connect: {:?}",
        transport.status()
    );
    (transport, rx)
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive the next forwarded message, panicking after five seconds.
pub async fn next_message(rx: &mut mpsc::Receiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a forwarded message")
        .expect("notification channel closed")
}

/// Whether the transport currently reports a captured session.
pub fn is_connected(transport: &SseTransport) -> bool {
    transport.status() == ConnectionStatus::Connected
}
