//! Correlation of responses to outstanding requests
//!
//! Every request sent on a connection registers an entry here before the
//! frame leaves the process. The reader side resolves entries by id; the
//! waiting caller enforces its deadline; a connection fault fails every entry
//! at once and closes the table to new registrations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::{McpClientError, McpResult};
use super::protocol::McpResponse;

type Delivery = McpResult<McpResponse>;

struct PendingEntry {
    tx: oneshot::Sender<Delivery>,
    deadline: Instant,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<u64, PendingEntry>,
    /// Set by `fail_all`; later registrations fail with this error
    closed_with: Option<McpClientError>,
}

/// Map from correlation id to the caller waiting on it
pub struct PendingRequestTable {
    server: String,
    state: Mutex<TableState>,
}

impl std::fmt::Debug for PendingRequestTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestTable")
            .field("server", &self.server)
            .field("pending", &self.len())
            .finish()
    }
}

impl PendingRequestTable {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            state: Mutex::new(TableState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`
    ///
    /// Fails if the id is already outstanding or the table was closed by a fault.
    pub fn register(self: &Arc<Self>, id: u64, deadline: Instant) -> McpResult<WaitHandle> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if let Some(err) = &state.closed_with {
                return Err(err.clone());
            }
            if state.entries.contains_key(&id) {
                return Err(McpClientError::MalformedMessage(format!(
                    "request id {id} is already outstanding"
                )));
            }
            state.entries.insert(id, PendingEntry { tx, deadline });
        }

        Ok(WaitHandle {
            id,
            deadline,
            rx,
            table: Arc::clone(self),
            finished: false,
        })
    }

    /// Deliver a response to its waiter
    ///
    /// Returns `false` (and drops the response) when no entry exists for the id.
    pub fn resolve(&self, id: u64, response: McpResponse) -> bool {
        self.complete(id, Ok(response))
    }

    /// Fail a single waiter
    pub fn fail(&self, id: u64, error: McpClientError) -> bool {
        self.complete(id, Err(error))
    }

    /// Unblock a waiter with `Cancelled`
    pub fn cancel(&self, id: u64) -> bool {
        self.complete(id, Err(McpClientError::Cancelled(id)))
    }

    fn complete(&self, id: u64, delivery: Delivery) -> bool {
        let mut state = self.lock();
        match state.entries.remove(&id) {
            Some(entry) => {
                if entry.tx.send(delivery).is_err() {
                    tracing::debug!(server = %self.server, id, "Waiter went away before delivery");
                }
                true
            }
            None => {
                tracing::warn!(
                    server = %self.server,
                    id,
                    "Dropping response for unknown or expired request id"
                );
                false
            }
        }
    }

    /// Remove an entry without notifying anyone
    pub fn discard(&self, id: u64) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Fail every outstanding entry with `error` and close the table
    ///
    /// # Returns
    ///
    /// The number of waiters that were failed
    pub fn fail_all(&self, error: McpClientError) -> usize {
        let mut state = self.lock();
        if state.closed_with.is_none() {
            state.closed_with = Some(error.clone());
        }
        let count = state.entries.len();
        for (_, entry) in state.entries.drain() {
            let _ = entry.tx.send(Err(error.clone()));
        }
        drop(state);

        if count > 0 {
            tracing::debug!(server = %self.server, count, %error, "Failed all pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed_with.is_some()
    }

    /// Earliest deadline among outstanding entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().entries.values().map(|e| e.deadline).min()
    }
}

/// Caller side of a registered request
///
/// Dropping the handle before it completes removes the entry, so an abandoned
/// call never leaks a table slot.
pub struct WaitHandle {
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Delivery>,
    table: Arc<PendingRequestTable>,
    finished: bool,
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl WaitHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response, a failure, or the deadline
    pub async fn wait(mut self) -> McpResult<McpResponse> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.rx).await;
        self.finished = true;

        match outcome {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(McpClientError::ConnectionLost(format!(
                "request {} was dropped without a response",
                self.id
            ))),
            Err(_) => {
                if self.table.discard(self.id) {
                    tracing::debug!(server = %self.table.server, id = self.id, "Request deadline elapsed");
                    return Err(McpClientError::Timeout(self.id));
                }
                // Resolution raced the deadline; deliveries happen under the table lock
                self.rx
                    .try_recv()
                    .unwrap_or(Err(McpClientError::Timeout(self.id)))
            }
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.table.discard(self.id);
        }
    }
}
