//! Error types for CDP transport operations
//!
//! Flat hierarchy. Transport and shutdown errors are terminal for the socket,
//! remote errors belong to a single command.

use thiserror::Error;

use crate::cdp::protocol::RequestId;

pub type Result<T> = std::result::Result<T, CDPError>;

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    Protocol(String),

    #[error("CDP remote error: {code} - {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Socket is shut down")]
    Shutdown,

    #[error("Command {id} ({method}) timed out")]
    Timeout { id: RequestId, method: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl CDPError {
    /// True for failures of the underlying connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, CDPError::WebSocket(_) | CDPError::Transport(_))
    }

    /// Description of a transport failure without the variant prefix,
    /// used when the same failure is reported to many commands.
    pub(crate) fn transport_message(&self) -> String {
        match self {
            CDPError::Transport(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// True when the error means the socket can no longer carry commands.
    pub fn is_terminal(&self) -> bool {
        self.is_transport() || matches!(self, CDPError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CDPError::Transport("reset".into()).is_transport());
        assert!(CDPError::Shutdown.is_terminal());
        assert!(!CDPError::Shutdown.is_transport());

        let remote = CDPError::Remote {
            code: -32601,
            message: "'Foo.bar' wasn't found".into(),
            data: None,
        };
        assert!(!remote.is_terminal());
        assert_eq!(
            remote.to_string(),
            "CDP remote error: -32601 - 'Foo.bar' wasn't found"
        );
    }
}
