//! Response Router - the single reader of the inbound stream
//!
//! Responses go straight to the dispatcher (a oneshot send, never blocks).
//! Events are paired with a snapshot of their handlers and handed to the
//! delivery task, so a slow handler can hold up later events but never a
//! command response. Handlers run on tokio's blocking pool, so even a handler
//! that blocks its thread leaves the read loop running on a current-thread
//! runtime.
//!
//! The delivery queue is unbounded: events are never dropped, and a handler
//! that cannot keep up with the event rate grows the backlog. The backlog is
//! counted and logged every time it passes another multiple of
//! `BACKLOG_WARN_STEP`.

use futures_util::StreamExt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::FrameStream;
use super::dispatcher::Dispatcher;
use super::protocol::{self, CDPEvent, CDPMessage, RequestId};
use super::registry::{EventCallback, EventRegistry};
use crate::error::CDPError;

const BACKLOG_WARN_STEP: usize = 1024;

/// Number of events routed but not yet fully delivered
pub(crate) type Backlog = Arc<AtomicUsize>;

/// An event together with the handlers registered when it was routed
pub(crate) struct Delivery {
    event: CDPEvent,
    handlers: Vec<EventCallback>,
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Routed {
    Response { id: RequestId, delivered: bool },
    Event { method: String, handlers: usize },
    Dropped,
}

pub(crate) struct Router {
    socket_id: String,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<EventRegistry>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    backlog: Backlog,
}

impl Router {
    pub(crate) fn new(
        socket_id: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<EventRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        let router = Self {
            socket_id: socket_id.into(),
            dispatcher,
            registry,
            deliveries,
            backlog: Backlog::default(),
        };
        (router, rx)
    }

    pub(crate) fn backlog(&self) -> Backlog {
        self.backlog.clone()
    }

    /// Route one frame. Never fails: bad frames are logged and dropped.
    pub(crate) fn handle_message(&self, text: &str) -> Routed {
        match protocol::decode(text) {
            Ok(CDPMessage::Response(response)) => {
                let id = response.id;
                let delivered = self.dispatcher.resolve(id, response.into_result());
                Routed::Response { id, delivered }
            }
            Ok(CDPMessage::Event(event)) => {
                let handlers = self.registry.handlers(&event.method);
                let method = event.method.clone();
                let count = handlers.len();
                tracing::trace!(socket_id = %self.socket_id, %method, handlers = count, "event received");
                if count > 0 {
                    // Receiver only goes away on shutdown; the event is moot then.
                    if self.deliveries.send(Delivery { event, handlers }).is_ok() {
                        let queued = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
                        if queued % BACKLOG_WARN_STEP == 0 {
                            tracing::warn!(
                                socket_id = %self.socket_id,
                                queued,
                                "event handlers are falling behind"
                            );
                        }
                    }
                }
                Routed::Event {
                    method,
                    handlers: count,
                }
            }
            Err(e) => match protocol::salvage_id(text) {
                Some(id) => {
                    tracing::warn!(socket_id = %self.socket_id, id, error = %e, "malformed response");
                    let delivered = self.dispatcher.resolve(id, Err(e));
                    Routed::Response { id, delivered }
                }
                None => {
                    tracing::warn!(
                        socket_id = %self.socket_id,
                        error = %e,
                        frame = %preview(text),
                        "dropping unroutable frame"
                    );
                    Routed::Dropped
                }
            },
        }
    }

    /// Read loop body. Returns the transport failure that ended it,
    /// `None` when cancelled.
    pub(crate) async fn read_loop(
        self,
        mut inbound: FrameStream,
        cancel: CancellationToken,
    ) -> Option<CDPError> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                frame = inbound.next() => frame,
            };

            match frame {
                Some(Ok(text)) => match self.handle_message(&text) {
                    Routed::Response {
                        id,
                        delivered: false,
                    } => {
                        tracing::debug!(socket_id = %self.socket_id, id, "no pending command for response, dropped");
                    }
                    Routed::Event {
                        method,
                        handlers: 0,
                    } => {
                        tracing::trace!(socket_id = %self.socket_id, %method, "event without subscribers");
                    }
                    _ => {}
                },
                Some(Err(e)) => {
                    tracing::error!(socket_id = %self.socket_id, error = %e, "read failed");
                    return Some(e);
                }
                None => {
                    tracing::info!(socket_id = %self.socket_id, "connection closed by remote");
                    return Some(CDPError::Transport("connection closed by remote".into()));
                }
            }
        }
    }
}

/// Delivery task body: runs handlers in registration order, one event at a time.
///
/// Each event's handlers run on the blocking pool and are awaited before the
/// next event starts, which keeps the order without tying up a runtime worker.
pub(crate) async fn deliver_events(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    backlog: Backlog,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => return,
            },
        };

        let run = tokio::task::spawn_blocking(move || run_handlers(delivery));
        tokio::select! {
            biased;
            // A handler still blocking its thread finishes there on its own.
            _ = cancel.cancelled() => return,
            finished = run => {
                if let Err(e) = finished {
                    tracing::error!(error = %e, "event delivery failed");
                }
            }
        }
        backlog.fetch_sub(1, Ordering::Relaxed);
    }
}

fn run_handlers(Delivery { event, handlers }: Delivery) {
    for handler in handlers {
        let payload = event.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
            tracing::error!(method = %event.method, "event handler panicked");
        }
    }
}

fn preview(text: &str) -> &str {
    const LIMIT: usize = 120;
    match text.char_indices().nth(LIMIT) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
