//! Chrome DevTools Protocol transport core
//!
//! One persistent connection to a debugging target, shared by any number of
//! concurrent callers. Commands get unique IDs and exactly one result each;
//! events fan out to the handlers registered for their method.
//!
//! Payloads stay opaque `serde_json::Value`s. Typed per-domain wrappers sit on
//! top via the [`Command`] and [`Event`] traits.
//!
//! ```no_run
//! use cdp::{CDPClient, SocketConfig};
//!
//! # async fn demo() -> cdp::Result<()> {
//! let client = CDPClient::connect(SocketConfig::new("ws://localhost:9222/devtools/browser")).await?;
//! let version = client.send_command("Browser.getVersion", None).await?;
//! println!("{}", version["product"]);
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cdp;
pub mod config;
pub mod error;

pub use cdp::{
    CDPClient, CDPEvent, CDPSession, Command, CommandHandle, Empty, Event, EventCallback,
    SocketState,
};
pub use config::SocketConfig;
pub use error::{CDPError, Result};
