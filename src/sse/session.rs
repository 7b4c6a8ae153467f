//! Connection session state and reconnect policy.
//!
//! The [`SessionManager`] owns everything the transport learns about one
//! streaming connection: the session identifier announced by the server,
//! the last record marker seen (for `Last-Event-ID` resumption), and the
//! observable [`ConnectionStatus`].
//!
//! ```text
//! Idle ─► Connecting ─► AwaitingSession ─► Connected
//!             ▲                                │ stream lost
//!             └──────── Reconnecting ◄─────────┘
//!                           │ ceiling reached        stop()
//!                           ▼                          │
//!                       Exhausted                   Stopped
//! ```
//!
//! Status changes are published on a [`watch`] channel so callers can wait
//! for `Connected` with a timeout instead of polling.

use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::sse::codec::SseEvent;

/// Record type the server uses to announce the submission endpoint.
pub const ENDPOINT_EVENT: &str = "endpoint";

/// Pattern extracting the session identifier from an endpoint announcement.
const SESSION_ID_PATTERN: &str = r"sessionId=([A-Za-z0-9-]+)";

#[allow(clippy::expect_used)] // constant pattern, covered by tests
static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SESSION_ID_PATTERN).expect("session id pattern compiles"));

/// Observable lifecycle state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not started.
    Idle,
    /// Opening the event stream.
    Connecting,
    /// Stream open, waiting for the server to announce a session.
    AwaitingSession,
    /// Session captured; submissions are routable.
    Connected,
    /// Stream lost; sleeping before the next attempt.
    Reconnecting {
        /// 1-based reconnect attempt about to be made.
        attempt: u32,
        /// Delay before that attempt.
        delay: Duration,
    },
    /// Stopped by the caller.
    Stopped,
    /// Reconnect ceiling reached; terminal until restarted.
    Exhausted,
}

impl ConnectionStatus {
    /// Whether no further connection attempts will be made.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exhausted)
    }
}

/// Linear-then-capped reconnect backoff.
///
/// The delay before attempt `n` (1-based) is `min(n * base, cap)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempts: u32,
    base: Duration,
    cap: Duration,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Create a policy; `max_attempts = None` retries forever.
    #[must_use]
    pub fn new(base: Duration, cap: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            attempts: 0,
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay applied before the given 1-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.cap)
    }

    /// Record a connection loss and return the delay before the next
    /// attempt, or `None` when the attempt ceiling has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failed attempts recorded so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Adopt a server-advised base delay.
    pub fn set_base(&mut self, base: Duration) {
        self.base = base;
    }
}

/// Snapshot of the session fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Identifier announced by the server; empty until captured.
    pub session_id: String,
    /// Raw data of the last endpoint announcement.
    pub endpoint: String,
    /// Marker of the last record carrying a non-empty `id`.
    pub last_event_id: String,
    /// Whether a session is currently routable.
    pub connected: bool,
}

/// Owner of one streaming connection's session and backoff state.
#[derive(Debug)]
pub struct SessionManager {
    state: Mutex<SessionState>,
    policy: Mutex<ReconnectPolicy>,
    initial_policy: ReconnectPolicy,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl SessionManager {
    /// Create an idle manager using `policy` for reconnects.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Idle);
        Self {
            state: Mutex::new(SessionState::default()),
            policy: Mutex::new(policy.clone()),
            initial_policy: policy,
            status_tx,
        }
    }

    /// Return to a fresh `Idle` state, discarding session and backoff data.
    pub fn reset(&self) {
        *self.lock_state() = SessionState::default();
        *self.lock_policy() = self.initial_policy.clone();
        self.set_status(ConnectionStatus::Idle);
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Publish a new status, waking every waiter.
    pub fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "session: status changed");
        }
    }

    /// Copy of the session fields.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.lock_state().clone()
    }

    /// Captured session identifier, if connected.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        let state = self.lock_state();
        (state.connected && !state.session_id.is_empty()).then(|| state.session_id.clone())
    }

    /// Marker to send as `Last-Event-ID` on the next connect, if any.
    #[must_use]
    pub fn resume_marker(&self) -> Option<String> {
        let state = self.lock_state();
        (!state.last_event_id.is_empty()).then(|| state.last_event_id.clone())
    }

    /// Consecutive reconnect attempts since the last received record.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.lock_policy().attempts()
    }

    /// The event stream was opened; a session announcement is expected next.
    pub fn stream_opened(&self) {
        self.set_status(ConnectionStatus::AwaitingSession);
    }

    /// Apply the bookkeeping effects of one received record.
    ///
    /// Returns `true` when the record was a control record consumed here.
    pub fn observe(&self, event: &SseEvent) -> bool {
        {
            let mut policy = self.lock_policy();
            policy.reset();
            if let Some(retry) = event.retry {
                debug!(retry_ms = retry, "session: server advised reconnect delay");
                policy.set_base(Duration::from_millis(retry));
            }
        }

        if let Some(id) = event.id.as_deref().filter(|id| !id.is_empty()) {
            self.lock_state().last_event_id = id.to_owned();
        }

        if event.event != ENDPOINT_EVENT {
            return false;
        }

        let Some(session_id) = extract_session_id(&event.data) else {
            warn!(data = %event.data, "session: endpoint record without sessionId, ignoring");
            return true;
        };

        {
            let mut state = self.lock_state();
            state.session_id.clone_from(&session_id);
            state.endpoint.clone_from(&event.data);
            state.connected = true;
        }
        info!(session_id, "session: captured session identifier");
        self.set_status(ConnectionStatus::Connected);
        true
    }

    /// The stream ended; the old session is no longer routable.
    pub fn mark_disconnected(&self) {
        {
            let mut state = self.lock_state();
            state.connected = false;
            state.session_id.clear();
        }
        if matches!(
            self.status(),
            ConnectionStatus::Connected | ConnectionStatus::AwaitingSession
        ) {
            self.set_status(ConnectionStatus::Connecting);
        }
    }

    /// Record a connection loss and compute the next backoff.
    ///
    /// Publishes `Reconnecting` with the chosen delay, or `Exhausted` when
    /// the ceiling is reached (returning `None`).
    pub fn next_backoff(&self) -> Option<Duration> {
        let (attempt, delay) = {
            let mut policy = self.lock_policy();
            let delay = policy.next_delay();
            (policy.attempts(), delay)
        };

        match delay {
            Some(delay) => {
                self.set_status(ConnectionStatus::Reconnecting { attempt, delay });
                Some(delay)
            }
            None => {
                self.set_status(ConnectionStatus::Exhausted);
                None
            }
        }
    }

    /// The transport was stopped.
    pub fn mark_stopped(&self) {
        self.mark_disconnected();
        if self.status() != ConnectionStatus::Exhausted {
            self.set_status(ConnectionStatus::Stopped);
        }
    }

    /// Wait until a session is captured.
    ///
    /// Returns `true` once `Connected` is reached, `false` on timeout or as
    /// soon as the manager reaches a terminal state.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.status_tx.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|status| *status == ConnectionStatus::Connected || status.is_terminal()),
        )
        .await;

        match reached {
            Ok(Ok(status)) => *status == ConnectionStatus::Connected,
            _ => false,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_policy(&self) -> MutexGuard<'_, ReconnectPolicy> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pull the `sessionId` query value out of an endpoint announcement.
#[must_use]
pub fn extract_session_id(data: &str) -> Option<String> {
    SESSION_ID_RE
        .captures(data)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}
