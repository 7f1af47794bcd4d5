//! Command Dispatcher - ID allocation and the pending-request table
//!
//! One mutex guards the ID counter, the pending table and the accepting flag.
//! A command is registered and queued for the writer under that lock, so the
//! wire order of commands is their ID order, and closing the dispatcher can
//! never miss a command that slipped in concurrently.
//!
//! The outbound queue is unbounded so `send_command` never waits. It only
//! holds commands callers issued that the writer has not reached yet.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::protocol::{CDPRequest, RequestId, SessionId};
use crate::error::{CDPError, Result};

/// What a pending command eventually receives
pub(crate) type Outcome = Result<Value>;

/// Serialized command waiting for the writer task
pub(crate) struct Outgoing {
    pub id: RequestId,
    pub frame: String,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Outcome>,
    created: Instant,
}

impl PendingRequest {
    fn resolve(self, id: RequestId, outcome: Outcome) {
        tracing::trace!(
            id,
            method = %self.method,
            elapsed_ms = self.created.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "command resolved"
        );
        // Receiver may be gone if the caller dropped the handle.
        let _ = self.tx.send(outcome);
    }
}

struct Inner {
    accepting: bool,
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
}

pub struct Dispatcher {
    socket_id: String,
    inner: Mutex<Inner>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    command_timeout: Option<Duration>,
}

impl Dispatcher {
    pub(crate) fn new(
        socket_id: impl Into<String>,
        command_timeout: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            socket_id: socket_id.into(),
            inner: Mutex::new(Inner {
                accepting: true,
                next_id: 1,
                pending: HashMap::new(),
            }),
            outbound,
            command_timeout,
        });
        (dispatcher, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing in the critical sections can leave `Inner` half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and queue a command. Never waits for the browser.
    pub fn send_command(
        self: &Arc<Self>,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> CommandHandle {
        let method = method.into();
        let (tx, rx) = oneshot::channel();

        let mut inner = self.lock();
        if !inner.accepting {
            drop(inner);
            tracing::debug!(socket_id = %self.socket_id, %method, "command rejected, socket is shut down");
            let _ = tx.send(Err(CDPError::Shutdown));
            return self.handle(None, method, rx);
        }

        let id = inner.next_id;
        let request = CDPRequest {
            id,
            method,
            params,
            session_id,
        };
        let frame = match serde_json::to_string(&request) {
            Ok(frame) => frame,
            Err(e) => {
                drop(inner);
                let _ = tx.send(Err(e.into()));
                return self.handle(None, request.method, rx);
            }
        };
        inner.next_id += 1;

        let method = request.method;
        inner.pending.insert(
            id,
            PendingRequest {
                method: method.clone(),
                tx,
                created: Instant::now(),
            },
        );
        if self.outbound.send(Outgoing { id, frame }).is_err() {
            // Writer is gone; only happens while the socket is being torn down.
            if let Some(entry) = inner.pending.remove(&id) {
                entry.resolve(id, Err(CDPError::Shutdown));
            }
        }
        drop(inner);

        tracing::trace!(socket_id = %self.socket_id, id, %method, "command queued");
        self.handle(Some(id), method, rx)
    }

    fn handle(
        self: &Arc<Self>,
        id: Option<RequestId>,
        method: String,
        rx: oneshot::Receiver<Outcome>,
    ) -> CommandHandle {
        CommandHandle {
            id,
            method,
            rx,
            dispatcher: Arc::downgrade(self),
            timeout: self.command_timeout,
        }
    }

    /// Deliver an outcome to the pending command `id`.
    /// Returns false for unknown or already resolved IDs.
    pub(crate) fn resolve(&self, id: RequestId, outcome: Outcome) -> bool {
        let entry = self.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                entry.resolve(id, outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a pending command without resolving it. False if it was already resolved.
    pub(crate) fn forget(&self, id: RequestId) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Stop accepting commands and fail everything still pending.
    /// Returns false if the dispatcher was already closed.
    pub(crate) fn close(&self, error: impl Fn() -> CDPError) -> bool {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            if !inner.accepting {
                return false;
            }
            inner.accepting = false;
            inner.pending.drain().collect()
        };

        if !drained.is_empty() {
            tracing::debug!(
                socket_id = %self.socket_id,
                count = drained.len(),
                "failing pending commands"
            );
        }
        for (id, entry) in drained {
            entry.resolve(id, Err(error()));
        }
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// IDs of commands still waiting for a response, sorted.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Writer task body: drains the outbound queue into the connection.
/// Returns the transport failure that ended it, `None` when cancelled.
pub(crate) async fn write_loop(
    dispatcher: Arc<Dispatcher>,
    connection: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    cancel: CancellationToken,
) -> Option<CDPError> {
    loop {
        let outgoing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            next = outbound.recv() => next?,
        };

        tracing::trace!(socket_id = %dispatcher.socket_id, id = outgoing.id, "writing frame");
        // A write stuck on a peer that stopped reading holds the sink lock;
        // dropping it on cancel lets shutdown close the connection.
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            written = connection.send(outgoing.frame) => written,
        };
        if let Err(e) = written {
            tracing::warn!(socket_id = %dispatcher.socket_id, id = outgoing.id, error = %e, "write failed");
            dispatcher.resolve(outgoing.id, Err(CDPError::Transport(e.transport_message())));
            return Some(e);
        }
    }
}

/// Caller-side handle of an in-flight command.
///
/// Await it (or call [`CommandHandle::wait`]) for the result. Dropping it
/// abandons the result; the response is still consumed when it arrives.
#[must_use = "a command handle does nothing unless awaited"]
pub struct CommandHandle {
    id: Option<RequestId>,
    method: String,
    rx: oneshot::Receiver<Outcome>,
    dispatcher: Weak<Dispatcher>,
    timeout: Option<Duration>,
}

impl CommandHandle {
    /// Assigned ID, `None` if the command was rejected before it got one.
    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Give up after `timeout`, overriding the socket default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn wait(self) -> Result<Value> {
        let CommandHandle {
            id,
            method,
            mut rx,
            dispatcher,
            timeout,
        } = self;

        let received = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    let forgotten = match (id, dispatcher.upgrade()) {
                        (Some(id), Some(dispatcher)) => dispatcher.forget(id),
                        _ => false,
                    };
                    match (forgotten, id) {
                        (true, Some(id)) => {
                            tracing::warn!(id, %method, ?limit, "command timed out");
                            return Err(CDPError::Timeout { id, method });
                        }
                        // Lost the race against a response that is being delivered.
                        _ => rx.await,
                    }
                }
            },
        };

        // Sender dropped unresolved: the socket went away underneath us.
        received.unwrap_or(Err(CDPError::Shutdown))
    }
}

impl IntoFuture for CommandHandle {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
