//! CDP (Chrome DevTools Protocol) transport
//!
//! Core principle: single connection, many concurrent callers.
//! IDs correlate responses, method names route events.

pub mod client;
pub mod command;
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub(crate) mod router;
pub mod session;

pub use client::{CDPClient, SocketState};
pub use command::{Command, Empty, Event};
pub use connection::{Connection, FrameSink, FrameStream, Peer};
pub use dispatcher::CommandHandle;
pub use protocol::{CDPEvent, CDPRequest, CDPResponse};
pub use registry::EventCallback;
pub use session::CDPSession;
