//! Typed commands and events
//!
//! Thin layer over the payload-agnostic client: a command type knows its
//! method name and how its result decodes, an event type knows which method
//! it listens to. Domain crates implement these traits; the transport never does.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::client::CDPClient;
use super::protocol::CDPEvent;
use super::registry::EventCallback;
use crate::error::Result;

pub trait Command: Serialize {
    const METHOD: &'static str;

    type Response: DeserializeOwned;
}

pub trait Event: DeserializeOwned {
    const METHOD: &'static str;
}

/// Result type of commands that return `{}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Empty {}

/// Serialize command params. Unit-like commands carry no params at all.
pub(crate) fn encode_params<C: Command>(command: &C) -> Result<Option<Value>> {
    match serde_json::to_value(command)? {
        Value::Null => Ok(None),
        params => Ok(Some(params)),
    }
}

/// Decode a command result; an absent result decodes as an empty object.
pub(crate) fn decode_result<C: Command>(result: Value) -> Result<C::Response> {
    let result = match result {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    Ok(serde_json::from_value(result)?)
}

impl CDPClient {
    /// Send a typed command and decode its result.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Response> {
        let params = encode_params(command)?;
        let result = self.send_command(C::METHOD, params).await?;
        decode_result::<C>(result)
    }

    /// Subscribe with a typed handler. Events that fail to decode are logged and skipped.
    pub fn on<E, F>(&self, handler: F)
    where
        E: Event + 'static,
        F: Fn(E) + Send + Sync + 'static,
    {
        self.subscribe(E::METHOD, typed_callback(handler));
    }
}

fn typed_callback<E, F>(handler: F) -> EventCallback
where
    E: Event + 'static,
    F: Fn(E) + Send + Sync + 'static,
{
    Arc::new(move |event: CDPEvent| {
        let params = match event.params {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        match serde_json::from_value::<E>(params) {
            Ok(decoded) => handler(decoded),
            Err(e) => tracing::warn!(method = E::METHOD, error = %e, "event params did not decode"),
        }
    })
}
