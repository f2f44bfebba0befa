//! Remote command (direct method) model.
//! Dispatch keys, requests, responses and the handler seam used by the listener.

use crate::device::Device;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;

/// Separator between component and method in the wire name of a command.
pub const COMPONENT_SEPARATOR: char = '*';

pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_FOUND: u16 = 404;

pub const UNKNOWN_METHOD: &str = "unknown method";

/// Typed dispatch key of a command: an optional component plus a method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKey {
    component: Option<String>,
    method: String,
}

impl CommandKey {
    /// Key for a method exposed by a named component.
    ///
    /// An empty component name means the method lives on the default component.
    pub fn new<C: Into<String>, M: Into<String>>(component: C, method: M) -> Self {
        let component = component.into();
        Self {
            component: (!component.is_empty()).then_some(component),
            method: method.into(),
        }
    }

    /// Key for a method on the default component.
    pub fn root<M: Into<String>>(method: M) -> Self {
        Self {
            component: None,
            method: method.into(),
        }
    }

    /// Splits a wire name at the first separator.
    ///
    /// Anything after the first `*` belongs to the method, so method names may
    /// contain the separator themselves.
    pub fn parse(name: &str) -> Self {
        match name.split_once(COMPONENT_SEPARATOR) {
            Some((component, method)) => Self::new(component, method),
            None => Self::root(name),
        }
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wire name as sent by the hub.
    pub fn wire_name(&self) -> String {
        match &self.component {
            Some(c) => format!("{}{}{}", c, COMPONENT_SEPARATOR, self.method),
            None => self.method.clone(),
        }
    }

    /// Whether a request carries this key.
    pub fn matches(&self, request: &CommandRequest) -> bool {
        request.key() == *self
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// Incoming command awaiting a response.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Correlation id used to route the response back to the caller
    pub request_id: String,
    /// Wire name (`component*method` or `method`)
    pub name: String,
    /// Raw payload, if any
    pub payload: Option<Value>,
}

impl CommandRequest {
    pub fn new<I: Into<String>, N: Into<String>>(
        request_id: I,
        name: N,
        payload: Option<Value>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            name: name.into(),
            payload,
        }
    }

    pub fn key(&self) -> CommandKey {
        CommandKey::parse(&self.name)
    }

    /// Payload as handed to handlers: a missing or `null` payload becomes `{}`.
    pub fn values(&self) -> Value {
        match &self.payload {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v) => v.clone(),
        }
    }
}

/// Response paired 1:1 with a request.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub request_id: String,
    pub status: u16,
    pub payload: Value,
}

impl CommandResponse {
    pub fn from_request(request: &CommandRequest, status: u16, payload: Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status,
            payload,
        }
    }
}

/// A command the device knows how to answer and act on.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Commands this handler accepts; `None` accepts every command.
    fn key(&self) -> Option<CommandKey>;

    /// Builds the acknowledgement payload. Runs before `on_command`.
    fn build_response(&self, payload: &Value) -> Value;

    /// Acts on the command once the caller has been answered.
    async fn on_command(&self, device: &Device, payload: Value) -> Result<()>;
}
