//! Connection - raw frame transport
//!
//! A connection is a write half (`FrameSink`) plus one inbound `FrameStream`.
//! The stream has exactly one reader: the router. Everything above this layer
//! deals in whole text frames and never sees WebSocket details.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use crate::config::SocketConfig;
use crate::error::{CDPError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound frames. `None` means the remote closed the connection,
/// an `Err` item means the transport failed.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Write side of a connection, shared by the writer task and the socket's shutdown path.
pub struct Connection {
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(sink: impl FrameSink + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a WebSocket to the configured debugger endpoint.
    pub async fn open(config: &SocketConfig) -> Result<(Self, FrameStream)> {
        let url = config.endpoint()?;

        let mut ws_config = WebSocketConfig::default();
        if let Some(limit) = config.max_message_size {
            ws_config.max_message_size = Some(limit);
            ws_config.max_frame_size = Some(limit);
        }

        let (ws_stream, _) = connect_async_with_config(url.as_str(), Some(ws_config), true).await?;
        let (sink, stream) = ws_stream.split();

        Ok((Self::new(WsFrameSink { sink }), ws_frames(stream)))
    }

    /// Write one frame. Fails once the connection has been closed.
    pub async fn send(&self, frame: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if self.is_closed() {
            return Err(CDPError::Transport("connection closed".to_string()));
        }
        sink.send_frame(frame).await
    }

    /// Close the write side. Only the first call reaches the transport.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sink.lock().await.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct WsFrameSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        self.sink.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Text frames of a WebSocket. Control frames are answered by tungstenite itself.
fn ws_frames(stream: SplitStream<WsStream>) -> FrameStream {
    stream::unfold(stream, |mut stream| async move {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some((Ok(text), stream)),
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    return Some((Ok(text), stream));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "WebSocket close frame received");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some((Err(e.into()), stream)),
                None => return None,
            }
        }
    })
    .boxed()
}

/// In-memory connection: a client side plus the `Peer` playing the browser.
pub fn pair() -> (Connection, FrameStream, Peer) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Result<String>>();

    let inbound = stream::unfold(inbound_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    let connection = Connection::new(MemoryFrameSink {
        tx: Some(outbound_tx),
    });
    let peer = Peer {
        outbound: outbound_rx,
        inbound: inbound_tx,
    };

    (connection, inbound, peer)
}

struct MemoryFrameSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemoryFrameSink {
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| CDPError::Transport("connection closed".to_string()))?;
        tx.send(frame)
            .map_err(|_| CDPError::Transport("peer hung up".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

/// Remote end of an in-memory connection.
pub struct Peer {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Result<String>>,
}

impl Peer {
    /// Next raw frame written by the client, `None` once the client closed its side.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next frame written by the client, parsed as JSON.
    pub async fn recv_command(&mut self) -> Option<Value> {
        let frame = self.recv_frame().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Frame already written by the client, if any, without waiting.
    pub fn try_recv_frame(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Deliver a raw frame to the client.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.inbound.send(Ok(frame.into())).is_ok()
    }

    /// Deliver a JSON frame to the client.
    pub fn push_json(&self, frame: &Value) -> bool {
        self.push(frame.to_string())
    }

    /// Make the client's inbound stream fail.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.inbound
            .send(Err(CDPError::Transport(reason.into())))
            .is_ok()
    }

    /// Drop both directions, as if the browser went away.
    pub fn hang_up(self) {}
}
