//! Duplex MCP transport over an SSE stream plus HTTP POST submissions.
//!
//! [`SseTransport::start`] spawns one receive task which opens the event
//! stream, feeds every network chunk through [`SseCodec`], and dispatches
//! the decoded records:
//!
//! | Record                          | Routed to                         |
//! |---------------------------------|-----------------------------------|
//! | `endpoint`                      | [`SessionManager`] (session id)   |
//! | `message`, JSON-RPC response    | [`Correlator`]                    |
//! | `message`, request/notification | caller's notification channel     |
//! | *(any other type)*              | Skipped; logged at `DEBUG`        |
//!
//! The notification channel is fed with `try_send`: when the caller falls
//! behind and the channel is full, further messages are dropped with a
//! `WARN` log rather than holding up responses.
//!
//! When the stream ends the task reconnects with linear, capped backoff and
//! resumes with `Last-Event-ID`. Every blocking point in the task races the
//! transport's [`CancellationToken`], so [`SseTransport::stop`] interrupts
//! reads and sleeps immediately and then joins the task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::header::{ACCEPT, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::TransportConfig;
use crate::correlator::Correlator;
use crate::jsonrpc::{self, Message};
use crate::sse::codec::{SseCodec, SseEvent, DEFAULT_EVENT_TYPE};
use crate::sse::session::{ConnectionStatus, ReconnectPolicy, SessionManager, SessionState};
use crate::{AppError, Result};

/// Header carrying the resumption marker on reconnect.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Query parameter routing a submission to the server-side session.
pub const SESSION_QUERY_PARAM: &str = "sessionId";

/// Result of [`SseTransport::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new receive task was spawned.
    Started,
    /// A receive task is already running; nothing changed.
    AlreadyRunning,
}

/// Receive task bookkeeping, present while started.
#[derive(Debug, Default)]
struct Lifecycle {
    /// Bumped on every start so a stale stop never clears a newer task.
    generation: u64,
    cancel: Option<CancellationToken>,
    /// Closes when the receive task exits, however it exits.
    exited: Option<watch::Receiver<()>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    config: TransportConfig,
    http: reqwest::Client,
    session: SessionManager,
    pending: Correlator,
}

/// Client transport for one MCP server reached over HTTP/SSE.
///
/// Cheap to clone; clones drive the same connection.
#[derive(Debug, Clone)]
pub struct SseTransport {
    shared: Arc<Shared>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl SseTransport {
    /// Build an idle transport from `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the endpoint URLs are invalid or the
    /// HTTP client cannot be constructed.
    pub fn new(config: TransportConfig) -> Result<Self> {
        // Fail early on unusable endpoints rather than inside the task.
        config.sse_url()?;
        config.message_url()?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

        let policy = ReconnectPolicy::new(
            config.reconnect_delay(),
            config.reconnect_cap(),
            config.max_retries,
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                http,
                session: SessionManager::new(policy),
                pending: Correlator::new(),
            }),
            lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
        })
    }

    /// Configuration this transport was built with.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.session.status()
    }

    /// Subscribe to connection status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.session.subscribe()
    }

    /// Captured session identifier, if connected.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.shared.session.session_id()
    }

    /// Last resumption marker seen on the stream.
    #[must_use]
    pub fn last_event_id(&self) -> Option<String> {
        self.shared.session.resume_marker()
    }

    /// Copy of the full session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.shared.session.snapshot()
    }

    /// Correlator tracking this transport's in-flight requests.
    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.shared.pending
    }

    /// Wait until a session is captured; `false` on timeout or terminal state.
    pub async fn wait_for_connection(&self, timeout: std::time::Duration) -> bool {
        self.shared.session.wait_for_connection(timeout).await
    }

    /// Spawn the receive task.
    ///
    /// Server-initiated requests and notifications are delivered on
    /// `notifications`. Starting an already running transport is a no-op;
    /// starting after `stop` or after retries were exhausted begins a fresh
    /// session with reset backoff.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, notifications: mpsc::Sender<Message>) -> StartOutcome {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.task.as_ref().is_some_and(|task| !task.is_finished()) {
            info!("sse transport: start requested while already running");
            return StartOutcome::AlreadyRunning;
        }

        let cancel = CancellationToken::new();
        self.shared.session.reset();
        self.shared.session.set_status(ConnectionStatus::Connecting);

        let shared = Arc::clone(&self.shared);
        let task_cancel = cancel.clone();
        let (exit_tx, exit_rx) = watch::channel(());
        let span = info_span!("sse_receive", url = %self.shared.config.base_url);
        let task = tokio::spawn(
            async move {
                let _exit = exit_tx;
                shared.run_receive_loop(notifications, task_cancel).await;
            }
            .instrument(span),
        );

        lifecycle.generation += 1;
        lifecycle.cancel = Some(cancel);
        lifecycle.exited = Some(exit_rx);
        lifecycle.task = Some(task);
        info!(base_url = %self.shared.config.base_url, "sse transport started");
        StartOutcome::Started
    }

    /// Stop the receive task and fail every pending call.
    ///
    /// Idempotent and safe to call from any task, including concurrently:
    /// every caller returns only after the receive task has fully exited and
    /// pending calls have been failed.
    pub async fn stop(&self) {
        let (generation, cancel, exited) = {
            let lifecycle = self.lock_lifecycle();
            (
                lifecycle.generation,
                lifecycle.cancel.clone(),
                lifecycle.exited.clone(),
            )
        };

        let Some(cancel) = cancel else {
            debug!("sse transport: stop requested while not running");
            return;
        };

        cancel.cancel();
        if let Some(mut exited) = exited {
            // The sender never publishes; `changed` errors once the task drops it.
            while exited.changed().await.is_ok() {}
        }

        // Finish cleanup before clearing the lifecycle so a later caller
        // that finds nothing running also finds the transport stopped.
        self.shared.session.mark_stopped();
        self.shared
            .pending
            .cancel_all(&AppError::Closed("transport stopped".into()));

        let task = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.generation == generation {
                lifecycle.cancel = None;
                lifecycle.exited = None;
                lifecycle.task.take()
            } else {
                None
            }
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "sse transport: receive task ended abnormally");
            }
        }
        info!("sse transport stopped");
    }

    /// Submit one message to the server.
    ///
    /// Waits up to the configured connection bound for a session, then
    /// POSTs the serialized message routed to that session.
    ///
    /// # Errors
    ///
    /// - `AppError::NotStarted` / `AppError::Closed` /
    ///   `AppError::ExhaustedRetries` when the transport cannot connect.
    /// - `AppError::SessionTimeout` when no session appears in time.
    /// - `AppError::Connection` when the POST fails or is rejected.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let session_id = self.await_session().await?;
        let body = jsonrpc::encode(message)?;

        let mut url = self.shared.config.message_url()?;
        url.query_pairs_mut()
            .append_pair(SESSION_QUERY_PARAM, &session_id);

        let request = self
            .shared
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.shared.config.submit_timeout())
            .body(body);
        let response = with_headers(request, &self.shared.config.headers)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Connection(format!(
                "submission rejected with {status}"
            )));
        }

        debug!(session_id, method = ?message.method(), id = ?message.id(), "sse transport: message submitted");

        match response.text().await {
            Ok(text) => self.shared.route_inline_reply(&text),
            Err(err) => debug!(error = %err, "sse transport: could not read submission reply"),
        }
        Ok(())
    }

    /// Send a request and wait for its correlated response.
    ///
    /// # Errors
    ///
    /// Any [`send`](Self::send) error, `AppError::RequestTimeout` when the
    /// response does not arrive within the configured request timeout,
    /// `AppError::Rpc` for an error response, or the terminal error the
    /// call was cancelled with.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (id, call) = self.shared.pending.register();
        self.send(&Message::request(id, method, params)).await?;
        call.wait(self.shared.config.request_timeout()).await
    }

    /// Send a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Any [`send`](Self::send) error.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(&Message::notification(method, params)).await
    }

    async fn await_session(&self) -> Result<String> {
        if let Some(err) = self.unavailable() {
            return Err(err);
        }

        let wait = self.shared.config.connection_wait();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !self.shared.session.wait_for_connection(remaining).await {
                return Err(self.unavailable().unwrap_or_else(|| {
                    AppError::SessionTimeout(format!("no session announced within {wait:?}"))
                }));
            }

            // The stream may drop between the wake-up and this read.
            if let Some(session_id) = self.shared.session.session_id() {
                return Ok(session_id);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::SessionTimeout(
                    "session lost before submission".into(),
                ));
            }
            tokio::task::yield_now().await;
        }
    }

    /// Error describing why the transport cannot accept submissions, if so.
    fn unavailable(&self) -> Option<AppError> {
        match self.shared.session.status() {
            ConnectionStatus::Idle => Some(AppError::NotStarted(
                "transport has not been started".into(),
            )),
            ConnectionStatus::Stopped => Some(AppError::Closed("transport stopped".into())),
            ConnectionStatus::Exhausted => Some(AppError::ExhaustedRetries(
                "reconnect attempts exhausted; restart the transport".into(),
            )),
            _ => None,
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shared {
    /// Connect, read, and reconnect until cancelled or exhausted.
    async fn run_receive_loop(
        &self,
        notifications: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) {
        let mut codec = SseCodec::new();

        loop {
            self.session.set_status(ConnectionStatus::Connecting);

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                outcome = self.read_stream(&mut codec, &notifications) => outcome,
            };

            self.session.mark_disconnected();
            match outcome {
                Ok(()) => info!("sse stream closed by server"),
                Err(err) => warn!(error = %err, "sse stream failed"),
            }

            if cancel.is_cancelled() {
                break;
            }

            let Some(delay) = self.session.next_backoff() else {
                warn!(
                    attempts = self.session.attempts(),
                    "sse reconnect attempts exhausted, giving up"
                );
                self.pending.cancel_all(&AppError::ExhaustedRetries(
                    "connection lost and reconnect attempts exhausted".into(),
                ));
                return;
            };

            info!(
                attempt = self.session.attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "sse reconnect scheduled"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.session.mark_stopped();
        debug!("sse receive loop exited");
    }

    /// Open the event stream once and dispatch records until it ends.
    ///
    /// `Ok(())` means the server closed the stream cleanly.
    async fn read_stream(
        &self,
        codec: &mut SseCodec,
        notifications: &mpsc::Sender<Message>,
    ) -> Result<()> {
        codec.reset();

        let mut request = self
            .http
            .get(self.config.sse_url()?)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive");
        request = with_headers(request, &self.config.headers);
        if let Some(marker) = self.session.resume_marker() {
            debug!(last_event_id = %marker, "sse resuming from marker");
            request = request.header(LAST_EVENT_ID_HEADER, marker);
        }

        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Connection(format!(
                "stream endpoint returned {status}"
            )));
        }
        self.session.stream_opened();
        debug!("sse stream opened");

        loop {
            let chunk = match self.config.idle_timeout() {
                Some(idle) => tokio::time::timeout(idle, response.chunk())
                    .await
                    .map_err(|_| {
                        AppError::Connection(format!("stream idle for longer than {idle:?}"))
                    })??,
                None => response.chunk().await?,
            };

            let Some(chunk) = chunk else {
                return Ok(());
            };

            for event in codec.feed(&chunk) {
                self.dispatch(event, notifications);
            }
        }
    }

    /// Route one decoded record.
    fn dispatch(&self, event: SseEvent, notifications: &mpsc::Sender<Message>) {
        if self.session.observe(&event) {
            return;
        }

        if event.event != DEFAULT_EVENT_TYPE {
            debug!(event_type = %event.event, "sse: skipping unknown record type");
            return;
        }

        let message = match jsonrpc::decode(&event.data) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, raw = %event.data, "sse: undecodable message, skipping");
                return;
            }
        };

        match message {
            Message::Response { id, payload } => {
                self.pending.resolve(&id, payload);
            }
            // Delivery must never stall the stream.
            other => match notifications.try_send(other) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    warn!(
                        method = ?message.method(),
                        "sse: notification channel full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("sse: notification receiver dropped, discarding message");
                }
            },
        }
    }

    /// Some servers answer the POST itself with the JSON-RPC response.
    fn route_inline_reply(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        match jsonrpc::decode(text) {
            Ok(Message::Response { id, payload }) => {
                debug!(%id, "sse transport: response delivered inline");
                self.pending.resolve(&id, payload);
            }
            Ok(_) | Err(_) => debug!(body = %text, "sse transport: ignoring submission reply"),
        }
    }
}

/// Merge configured headers into a request.
fn with_headers(mut request: RequestBuilder, headers: &HashMap<String, String>) -> RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}
