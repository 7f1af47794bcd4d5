//! Socket configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::error::{CDPError, Result};

/// Configuration for one CDP socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Identifier attached to every log line of this socket
    pub id: String,

    /// Debugger WebSocket endpoint, e.g. `ws://localhost:9222/devtools/browser/<id>`
    pub url: String,

    /// Per-command deadline in milliseconds. `None` waits forever.
    pub command_timeout_ms: Option<u64>,

    /// Largest inbound message accepted by the WebSocket layer.
    /// Screenshots and DOM snapshots can be large; `None` keeps the library default.
    pub max_message_size: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            url: "ws://localhost:9222/devtools/browser".to_string(),
            command_timeout_ms: None,
            max_message_size: None,
        }
    }
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Sub-millisecond timeouts round up to 1ms; only `Duration::ZERO` maps to 0,
    /// which `validate` rejects.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        let mut millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 && !timeout.is_zero() {
            millis = 1;
        }
        self.command_timeout_ms = Some(millis);
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Parse and check the endpoint URL.
    pub fn endpoint(&self) -> Result<Url> {
        let url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(CDPError::Config(format!(
                "unsupported scheme '{}' in {}, expected ws or wss",
                other, self.url
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        if self.command_timeout_ms == Some(0) {
            return Err(CDPError::Config(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_message_size == Some(0) {
            return Err(CDPError::Config(
                "max_message_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
