//! CDP Client - the socket facade
//!
//! Design decisions:
//! 1. Single connection per browser, one reader task, one writer task
//! 2. `send_command` never waits for the browser - it hands back a `CommandHandle`
//! 3. Request/response matching via ID, events fanned out to subscribers
//! 4. Fail fast - no retries, no reconnect. Let the caller decide.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected -> Closing -> Closed`.
//! Closing fails every pending command exactly once, with `Shutdown` for a
//! requested stop and `Transport` when the connection broke underneath us.

use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, FrameStream};
use super::dispatcher::{write_loop, CommandHandle, Dispatcher};
use super::protocol::{RequestId, SessionId};
use super::registry::{EventCallback, EventRegistry};
use super::router::{deliver_events, Backlog, Router};
use crate::config::SocketConfig;
use crate::error::{CDPError, Result};

/// Upper bound on the close handshake during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

enum CloseReason {
    Stopped,
    Transport(String),
}

/// State shared between the facade and its background tasks
struct Shared {
    id: String,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<EventRegistry>,
    backlog: Backlog,
    connection: Arc<Connection>,
    cancel: CancellationToken,
    state: watch::Sender<SocketState>,
}

impl Shared {
    async fn shutdown(&self, reason: CloseReason) {
        let first = match &reason {
            CloseReason::Stopped => self.dispatcher.close(|| CDPError::Shutdown),
            CloseReason::Transport(message) => self
                .dispatcher
                .close(|| CDPError::Transport(message.clone())),
        };
        if !first {
            // Someone else is already tearing down.
            self.wait_closed().await;
            return;
        }

        self.state.send_replace(SocketState::Closing);
        match &reason {
            CloseReason::Stopped => tracing::info!(socket_id = %self.id, "stopping socket"),
            CloseReason::Transport(message) => {
                tracing::warn!(socket_id = %self.id, error = %message, "transport failed, closing socket")
            }
        }

        self.cancel.cancel();
        match tokio::time::timeout(CLOSE_TIMEOUT, self.connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(socket_id = %self.id, error = %e, "error while closing connection")
            }
            Err(_) => {
                tracing::warn!(socket_id = %self.id, ?CLOSE_TIMEOUT, "connection close timed out, abandoning it")
            }
        }

        self.state.send_replace(SocketState::Closed);
        tracing::info!(socket_id = %self.id, "socket closed");
    }

    async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        loop {
            let closed = *state.borrow_and_update() == SocketState::Closed;
            // The sender lives in `self`, so `changed` only fails if it is gone.
            if closed || state.changed().await.is_err() {
                return;
            }
        }
    }
}

/// CDP Client - one connection to a browser debugging endpoint
pub struct CDPClient {
    shared: Arc<Shared>,
}

impl CDPClient {
    /// Connect to a Chrome DevTools Protocol endpoint.
    pub async fn connect(config: SocketConfig) -> Result<Arc<Self>> {
        config.validate()?;
        tracing::info!(
            socket_id = %config.id,
            url = %config.url,
            state = ?SocketState::Connecting,
            "connecting"
        );

        let (connection, inbound) = match Connection::open(&config).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(
                    socket_id = %config.id,
                    error = %e,
                    state = ?SocketState::Disconnected,
                    "connect failed"
                );
                return Err(e);
            }
        };

        Ok(Self::with_connection(config, connection, inbound))
    }

    /// Build a connected socket over an already open connection.
    ///
    /// Spawns the reader, writer and event delivery tasks, so it must run
    /// inside a tokio runtime.
    pub fn with_connection(
        config: SocketConfig,
        connection: Connection,
        inbound: FrameStream,
    ) -> Arc<Self> {
        let connection = Arc::new(connection);
        let (dispatcher, outbound) = Dispatcher::new(config.id.clone(), config.command_timeout());
        let registry = Arc::new(EventRegistry::new());
        let (router, deliveries) =
            Router::new(config.id.clone(), dispatcher.clone(), registry.clone());
        let backlog = router.backlog();
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(SocketState::Connected);

        let shared = Arc::new(Shared {
            id: config.id,
            dispatcher,
            registry,
            backlog,
            connection,
            cancel,
            state,
        });

        let writer = shared.clone();
        tokio::spawn(async move {
            let failure = write_loop(
                writer.dispatcher.clone(),
                writer.connection.clone(),
                outbound,
                writer.cancel.clone(),
            )
            .await;
            if let Some(e) = failure {
                writer
                    .shutdown(CloseReason::Transport(e.transport_message()))
                    .await;
            }
        });

        let reader = shared.clone();
        tokio::spawn(async move {
            if let Some(e) = router.read_loop(inbound, reader.cancel.clone()).await {
                reader
                    .shutdown(CloseReason::Transport(e.transport_message()))
                    .await;
            }
        });

        tokio::spawn(deliver_events(
            deliveries,
            shared.backlog.clone(),
            shared.cancel.clone(),
        ));

        tracing::info!(socket_id = %shared.id, state = ?SocketState::Connected, "connected");
        Arc::new(Self { shared })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> SocketState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    /// Issue a command. Returns immediately; await the handle for the result.
    pub fn send_command(&self, method: impl Into<String>, params: Option<Value>) -> CommandHandle {
        self.dispatch(method, params, None)
    }

    pub(crate) fn dispatch(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> CommandHandle {
        self.shared.dispatcher.send_command(method, params, session_id)
    }

    /// Send CDP request and wait for response
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value> {
        self.send_command(method, params).await
    }

    /// Subscribe to CDP events
    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) {
        self.shared.registry.subscribe(method, callback);
    }

    /// Stop the socket. Safe to call repeatedly and concurrently; every caller
    /// returns once the socket is closed.
    pub async fn stop(&self) {
        self.shared.shutdown(CloseReason::Stopped).await;
    }

    /// Resolves once the socket reached `Closed`, whatever the cause.
    pub async fn wait_closed(&self) {
        self.shared.wait_closed().await;
    }

    pub fn pending_count(&self) -> usize {
        self.shared.dispatcher.pending_count()
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.shared.dispatcher.pending_ids()
    }

    /// Events received but not yet through all their handlers.
    pub fn pending_events(&self) -> usize {
        self.shared.backlog.load(Ordering::Relaxed)
    }
}

impl Drop for CDPClient {
    fn drop(&mut self) {
        // Background tasks exit on cancel and release the dispatcher; pending
        // handles then resolve with `Shutdown`.
        if self.is_connected() {
            tracing::debug!(socket_id = %self.shared.id, "client dropped without stop");
        }
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::connection::{pair, FrameSink, Peer};
    use crate::cdp::protocol::CDPEvent;
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use serde_json::json;
    use std::future::IntoFuture;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    fn socket() -> (Arc<CDPClient>, Peer) {
        socket_with(SocketConfig::default())
    }

    fn socket_with(config: SocketConfig) -> (Arc<CDPClient>, Peer) {
        let (connection, inbound, peer) = pair();
        (CDPClient::with_connection(config, connection, inbound), peer)
    }

    /// Sink of a peer that stopped reading: writes never complete.
    struct StalledSink {
        close_stalls: bool,
    }

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send_frame(&mut self, _frame: String) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            if self.close_stalls {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn stalled_socket(close_stalls: bool) -> Arc<CDPClient> {
        CDPClient::with_connection(
            SocketConfig::default(),
            Connection::new(StalledSink { close_stalls }),
            stream::pending().boxed(),
        )
    }

    async fn expect_command(peer: &mut Peer) -> Value {
        tokio::time::timeout(Duration::from_secs(5), peer.recv_command())
            .await
            .expect("no command written")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn test_result_error_and_event_round_trip() {
        let (client, mut peer) = socket();

        let handle = client.send_command("Foo.bar", Some(json!({ "x": 1 })));
        assert_eq!(
            expect_command(&mut peer).await,
            json!({ "id": 1, "method": "Foo.bar", "params": { "x": 1 } })
        );
        peer.push(r#"{"id":1,"result":{"y":2}}"#);
        assert_eq!(assert_ok!(handle.await), json!({ "y": 2 }));

        let handle = client.send_command("Foo.bar", Some(json!({ "x": 1 })));
        let id = expect_command(&mut peer).await["id"].as_u64().unwrap();
        peer.push_json(&json!({ "id": id, "error": { "code": 5, "message": "boom" } }));
        match handle.await {
            Err(CDPError::Remote { code, message, .. }) => {
                assert_eq!(code, 5);
                assert_eq!(message, "boom");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
        // A remote error is not fatal.
        assert!(client.is_connected());

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe(
            "Foo.changed",
            Arc::new(move |event: CDPEvent| {
                let _ = tx.send(event.params);
            }),
        );
        peer.push(r#"{"method":"Foo.changed","params":{"z":3}}"#);
        assert_eq!(rx.recv().await, Some(json!({ "z": 3 })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_route_by_id() {
        let (client, mut peer) = socket();

        let handles: Vec<_> = (0..10)
            .map(|n| client.send_command("Echo.call", Some(json!({ "n": n }))))
            .collect();

        let mut commands = Vec::new();
        for _ in 0..10 {
            commands.push(expect_command(&mut peer).await);
        }
        for command in commands.iter().rev() {
            peer.push_json(&json!({ "id": command["id"], "result": { "n": command["params"]["n"] } }));
        }

        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), json!({ "n": n }));
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_dropped() {
        let (client, mut peer) = socket();

        let first = client.send_command("A.a", None);
        expect_command(&mut peer).await;
        peer.push(r#"{"id":1,"result":{"v":"first"}}"#);
        peer.push(r#"{"id":1,"result":{"v":"second"}}"#);
        assert_eq!(first.await.unwrap(), json!({ "v": "first" }));

        let second = client.send_command("B.b", None);
        assert_eq!(second.id(), Some(2));
        expect_command(&mut peer).await;
        peer.push(r#"{"id":2,"result":{"v":"ok"}}"#);
        assert_eq!(second.await.unwrap(), json!({ "v": "ok" }));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_event_fan_out_in_registration_order() {
        let (client, peer) = socket();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            client.subscribe(
                "Foo.changed",
                Arc::new(move |_| seen.lock().unwrap().push(tag)),
            );
        }
        let other = seen.clone();
        client.subscribe(
            "Foo.other",
            Arc::new(move |_| other.lock().unwrap().push("other")),
        );
        client.subscribe(
            "Test.sentinel",
            Arc::new(move |_| {
                let _ = done_tx.send(());
            }),
        );

        peer.push(r#"{"method":"Foo.changed","params":{}}"#);
        peer.push(r#"{"method":"Test.sentinel"}"#);
        done_rx.recv().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stop_drains_pending_and_closes_connection() {
        let (client, mut peer) = socket();

        let handles: Vec<_> = (0..5).map(|_| client.send_command("Slow.call", None)).collect();
        for _ in 0..5 {
            expect_command(&mut peer).await;
        }
        assert_eq!(client.pending_ids(), vec![1, 2, 3, 4, 5]);

        client.stop().await;
        assert_eq!(client.state(), SocketState::Closed);

        for handle in handles {
            assert!(matches!(handle.await, Err(CDPError::Shutdown)));
        }
        // Write side closed.
        assert_eq!(peer.recv_frame().await, None);

        let late = client.send_command("Late.call", None);
        assert_eq!(late.id(), None);
        assert!(matches!(late.await, Err(CDPError::Shutdown)));
    }

    #[tokio::test]
    async fn test_stop_completes_behind_stalled_write() {
        let client = stalled_socket(false);
        let handle = client.send_command("Stuck.call", None);
        // Let the writer pick the frame up and block inside the sink.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(2), client.stop())
            .await
            .expect("stop hung behind a stalled write");
        assert_eq!(client.state(), SocketState::Closed);
        assert!(matches!(handle.await, Err(CDPError::Shutdown)));

        // Concurrent waiters are released as well.
        tokio::time::timeout(Duration::from_secs(2), client.wait_closed())
            .await
            .expect("wait_closed hung");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_stalled_close() {
        let client = stalled_socket(true);
        let handle = client.send_command("Stuck.call", None);
        tokio::task::yield_now().await;

        client.stop().await;
        assert_eq!(client.state(), SocketState::Closed);
        assert!(matches!(handle.await, Err(CDPError::Shutdown)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (client, _peer) = socket();
        tokio::join!(client.stop(), client.stop());
        client.stop().await;
        assert_eq!(client.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_frame_between_valid_frames() {
        let (client, mut peer) = socket();
        let first = client.send_command("A.a", None);
        let second = client.send_command("B.b", None);
        expect_command(&mut peer).await;
        expect_command(&mut peer).await;

        peer.push(r#"{"id":1,"result":{"n":1}}"#);
        peer.push(r#"{"definitely": "not cdp"#);
        peer.push(r#"{"id":2,"result":{"n":2}}"#);

        assert_eq!(first.await.unwrap(), json!({ "n": 1 }));
        assert_eq!(second.await.unwrap(), json!({ "n": 2 }));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_transport_failure_fails_pending() {
        let (client, mut peer) = socket();
        let handle = client.send_command("A.a", None);
        expect_command(&mut peer).await;

        peer.fail("connection reset");
        match handle.await {
            Err(CDPError::Transport(message)) => assert_eq!(message, "connection reset"),
            other => panic!("expected transport error, got {:?}", other),
        }

        client.wait_closed().await;
        assert_eq!(client.state(), SocketState::Closed);
        assert!(matches!(
            client.send_command("B.b", None).await,
            Err(CDPError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_remote_hang_up_closes_socket() {
        let (client, peer) = socket();
        let handle = client.send_command("A.a", None);
        peer.hang_up();

        assert!(handle.await.unwrap_err().is_transport());
        client.wait_closed().await;
        // Stopping a closed socket is a no-op.
        client.stop().await;
        assert_eq!(client.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_blocked_handler_does_not_stall_responses() {
        let (client, mut peer) = socket();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate_rx);
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();

        client.subscribe(
            "Slow.event",
            Arc::new(move |_| {
                let _ = entered_tx.send(());
                let _ = gate.lock().unwrap().recv();
            }),
        );

        peer.push(r#"{"method":"Slow.event"}"#);
        entered_rx.recv().await.unwrap();

        // Events behind the blocked one wait in the backlog.
        peer.push(r#"{"method":"Slow.event"}"#);
        peer.push(r#"{"method":"Slow.event"}"#);

        let handle = client.send_command("Fast.call", None);
        expect_command(&mut peer).await;
        peer.push(r#"{"id":1,"result":{"fast":true}}"#);

        let result = tokio::time::timeout(Duration::from_secs(5), handle.into_future())
            .await
            .expect("response stalled behind event handler");
        assert_eq!(result.unwrap(), json!({ "fast": true }));
        assert_eq!(client.pending_events(), 3);

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        for _ in 0..2 {
            entered_rx.recv().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeout_keeps_socket_open() {
        let config = SocketConfig::default().with_command_timeout(Duration::from_millis(200));
        let (client, mut peer) = socket_with(config);

        let handle = client.send_command("Never.answered", None);
        expect_command(&mut peer).await;
        assert!(matches!(handle.await, Err(CDPError::Timeout { id: 1, .. })));

        // Late reply is ignored, socket keeps working.
        peer.push(r#"{"id":1,"result":{}}"#);
        let next = client.send_command("Next.call", None);
        expect_command(&mut peer).await;
        peer.push(r#"{"id":2,"result":{"ok":true}}"#);
        assert_eq!(next.await.unwrap(), json!({ "ok": true }));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_send_request_waits_for_result() {
        let (client, mut peer) = socket();
        let responder = tokio::spawn(async move {
            let command = expect_command(&mut peer).await;
            peer.push_json(&json!({ "id": command["id"], "result": { "product": "Chrome" } }));
            peer
        });

        let version = client.send_request("Browser.getVersion", None).await.unwrap();
        assert_eq!(version["product"], "Chrome");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_fails_pending() {
        let (client, _peer) = socket();
        let handle = client.send_command("A.a", None);
        drop(client);
        assert!(matches!(handle.await, Err(CDPError::Shutdown)));
    }
}
