//! CDP Session - commands and events scoped to one attached target
//!
//! Flat session mode: all sessions share the client's connection, traffic is
//! tagged with `sessionId`. No per-session connection overhead.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::client::CDPClient;
use super::command::{decode_result, encode_params, Command};
use super::dispatcher::CommandHandle;
use super::protocol::{AttachToTargetResult, CDPEvent, SessionId, TargetId};
use super::registry::EventCallback;
use crate::error::Result;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachToTarget<'a> {
    target_id: &'a str,
    flatten: bool,
}

impl Command for AttachToTarget<'_> {
    const METHOD: &'static str = "Target.attachToTarget";
    type Response = AttachToTargetResult;
}

/// CDP Session bound to a specific target
#[derive(Clone)]
pub struct CDPSession {
    /// Shared CDP client
    client: Arc<CDPClient>,

    /// Target this session is attached to
    pub target_id: TargetId,

    /// Session ID assigned by Chrome
    pub session_id: SessionId,
}

impl CDPSession {
    /// Attach to a target in flat mode and create the session.
    pub async fn attach(client: Arc<CDPClient>, target_id: TargetId) -> Result<Self> {
        let attached = client
            .execute(&AttachToTarget {
                target_id: &target_id,
                flatten: true,
            })
            .await?;

        tracing::debug!(
            socket_id = %client.id(),
            %target_id,
            session_id = %attached.session_id,
            "attached to target"
        );

        Ok(Self::new(client, target_id, attached.session_id))
    }

    /// Wrap a session that was attached elsewhere.
    pub fn new(client: Arc<CDPClient>, target_id: TargetId, session_id: SessionId) -> Self {
        Self {
            client,
            target_id,
            session_id,
        }
    }

    /// Issue a command within this session's context.
    pub fn send_command(&self, method: impl Into<String>, params: Option<Value>) -> CommandHandle {
        self.client
            .dispatch(method, params, Some(self.session_id.clone()))
    }

    /// Send command within this session's context and wait for the result
    pub async fn send(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.send_command(method, params).await
    }

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Response> {
        let params = encode_params(command)?;
        let result = self.send_command(C::METHOD, params).await?;
        decode_result::<C>(result)
    }

    /// Subscribe to events raised by this session's target only.
    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) {
        let session_id = self.session_id.clone();
        self.client.subscribe(
            method,
            Arc::new(move |event: CDPEvent| {
                if event.session_id.as_deref() == Some(session_id.as_str()) {
                    callback(event);
                }
            }),
        );
    }

    /// Detach from the target. The session must not be used afterwards.
    pub async fn detach(self) -> Result<()> {
        self.client
            .send_request(
                "Target.detachFromTarget",
                Some(json!({ "sessionId": &self.session_id })),
            )
            .await?;
        tracing::debug!(session_id = %self.session_id, "detached from target");
        Ok(())
    }

    pub fn client(&self) -> &Arc<CDPClient> {
        &self.client
    }
}
