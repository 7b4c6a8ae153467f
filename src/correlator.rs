//! Request/response correlation for in-flight JSON-RPC calls.
//!
//! Every outbound request registers a [`PendingCall`]: a `oneshot` slot
//! stored in a mutex-guarded map under the request identifier. Responses
//! arriving on the event stream look the slot up and complete it exactly
//! once. Unknown identifiers (late, duplicate, or foreign responses) are
//! discarded with a `DEBUG` log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::jsonrpc::{RequestId, ResponsePayload};
use crate::{AppError, Result};

/// Outcome delivered through a pending call's slot.
type Slot = oneshot::Sender<Result<Value>>;

#[derive(Debug)]
struct Inner {
    /// Next identifier to hand out; never reused.
    next_id: AtomicU64,
    /// Pending slots keyed by request identifier.
    pending: Mutex<HashMap<RequestId, Slot>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Slot>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: &RequestId) -> Option<Slot> {
        self.lock().remove(id)
    }
}

/// Thread-safe map of in-flight calls. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create an empty correlator whose first identifier is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocate a fresh identifier and register a pending call for it.
    #[must_use]
    pub fn register(&self) -> (RequestId, PendingCall) {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(id.clone(), tx);

        let call = PendingCall {
            id: id.clone(),
            rx,
            owner: Arc::clone(&self.inner),
        };
        (id, call)
    }

    /// Complete the call for `id` with a response payload.
    ///
    /// Returns `false` when no call is pending under `id`.
    pub fn resolve(&self, id: &RequestId, payload: ResponsePayload) -> bool {
        self.complete(id, payload.into_result())
    }

    /// Fail the call for `id` with `error`.
    ///
    /// Returns `false` when no call is pending under `id`.
    pub fn fail(&self, id: &RequestId, error: AppError) -> bool {
        self.complete(id, Err(error))
    }

    /// Abandon the call for `id`; its waiter observes `AppError::Cancelled`.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.fail(id, AppError::Cancelled(format!("request {id} cancelled")))
    }

    /// Fail every pending call with a clone of `error`, emptying the map.
    ///
    /// Returns the number of calls that were pending.
    pub fn cancel_all(&self, error: &AppError) -> usize {
        let drained: Vec<(RequestId, Slot)> = self.inner.lock().drain().collect();
        let count = drained.len();
        for (id, slot) in drained {
            if slot.send(Err(error.clone())).is_err() {
                debug!(%id, "correlator: waiter gone before cancellation");
            }
        }
        if count > 0 {
            debug!(count, error = %error, "correlator: cancelled pending calls");
        }
        count
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no call is awaiting a response.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a call is pending under `id`.
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().contains_key(id)
    }

    fn complete(&self, id: &RequestId, outcome: Result<Value>) -> bool {
        let Some(slot) = self.inner.remove(id) else {
            debug!(%id, "correlator: no pending call, discarding response");
            return false;
        };
        if slot.send(outcome).is_err() {
            debug!(%id, "correlator: waiter gone before response arrived");
        }
        true
    }
}

/// Handle for one outstanding request.
///
/// Dropping the handle without awaiting it withdraws the registration.
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value>>,
    owner: Arc<Inner>,
}

impl PendingCall {
    /// Identifier this call is registered under.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response.
    ///
    /// # Errors
    ///
    /// - `AppError::RequestTimeout` when nothing arrives within `timeout`;
    ///   only this call is withdrawn.
    /// - `AppError::Rpc` when the server answered with an error object.
    /// - Whatever error the call was failed or cancelled with.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AppError::Cancelled(format!(
                "request {} dropped without a response",
                self.id
            ))),
            Err(_) => {
                self.owner.remove(&self.id);
                Err(AppError::RequestTimeout(format!(
                    "request {} not answered within {timeout:?}",
                    self.id
                )))
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.owner.remove(&self.id);
    }
}
